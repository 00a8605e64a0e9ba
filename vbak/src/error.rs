// vbak is the operator tool of the vbak subvolume backup agent.
// Copyright (C) 2026  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("The daemon rejected the request: {0}")]
    Rejected(String),
    #[error("The daemon sent an unexpected response")]
    UnexpectedResponse,
    #[error("Unknown run outcome \"{0}\"")]
    UnknownOutcome(String),
    #[error("Invalid subvolume spec \"{0}\", expected name=path")]
    BadSubvolumeSpec(String),

    #[error("A local system error occured: {0}")]
    VbakSystem(#[from] vbak_common::SystemError),
    #[error("A control socket error occured: {0}")]
    VbakControl(#[from] vbak_common::ControlError),

    #[error("Unable to parse timestamp: {0}")]
    TimestampParse(#[from] chrono::ParseError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
