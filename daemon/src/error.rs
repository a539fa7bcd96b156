// Copyright (C) 2020-2021 The RustyBGP Authors.
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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("must argument is empty")]
    EmptyArgument,
    #[error("argument is incorrect: {0}")]
    InvalidArgument(String),
    #[error("entity already exists: {0}")]
    AlreadyExists(String),
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("feature isn't supported")]
    Unimplemented,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("incorrect bgp format {code}/{subcode}")]
    InvalidMessageFormat {
        code: u8,
        subcode: u8,
        data: Vec<u8>,
    },
    #[error("incorrect bmp format: {0}")]
    InvalidBmpFormat(String),
    #[error("update too long: {len} bytes")]
    UpdateTooLong { len: usize },

    #[error("prefix limit {limit} exceeded")]
    PrefixLimitExceeded { limit: u64 },
    #[error("out of path IDs")]
    OutOfPathIds,

    #[error("std::io::Error")]
    StdIoErr(#[from] std::io::Error),
}

impl Error {
    /// NOTIFICATION code/subcode carried by a wire format error.
    pub fn notification(&self) -> Option<(u8, u8, Vec<u8>)> {
        match self {
            Error::InvalidMessageFormat {
                code,
                subcode,
                data,
            } => Some((*code, *subcode, data.to_owned())),
            _ => None,
        }
    }
}
