// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of murmur.
//
// murmur is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// murmur is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with murmur.  If not,
// see <http://www.gnu.org/licenses/>.

//! # http
//!
//! Odds & ends shared by murmur's HTTP handlers.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

/// A serializable struct for use in HTTP error responses
///
/// Every murmur error response carries a JSON body of the form `{"error": "..."}`. Nothing
/// enforces that, but handlers build their error responses through this type.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl ErrorResponseBody {
    pub fn new(err: impl std::fmt::Display) -> ErrorResponseBody {
        ErrorResponseBody {
            error: format!("{}", err),
        }
    }
}

impl IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Shorthand for a status code paired with an [ErrorResponseBody]
pub fn error_response(status: StatusCode, err: impl std::fmt::Display) -> axum::response::Response {
    (status, ErrorResponseBody::new(err)).into_response()
}
