// Copyright (C) 2021 The RustyBGP Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod packet {
    pub mod bgp;
    pub mod bmp;
}

pub mod bmp;
pub mod config;
pub mod error;
pub mod fsm;
pub mod mirror;
pub mod net;
pub mod peer;
pub mod table;
pub mod update_sender;
