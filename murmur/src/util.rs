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

//! # util
//!
//! Small helpers with no better home.

use std::fmt::Display;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tap::Pipe;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          exactly_two                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What went wrong when an iterator didn't yield exactly two items
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExactlyTwoError {
    NoElements,
    OneElement,
    ThreeOrMore,
}

impl Display for ExactlyTwoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExactlyTwoError::NoElements => write!(f, "ExactlyTwoError: no elements"),
            ExactlyTwoError::OneElement => write!(f, "ExactlyTwoError: One element"),
            ExactlyTwoError::ThreeOrMore => write!(f, "ExactlyTwoError: Three or more elements"),
        }
    }
}

impl std::error::Error for ExactlyTwoError {}

pub fn exactly_two<T>(mut iter: T) -> std::result::Result<(T::Item, T::Item), ExactlyTwoError>
where
    T: std::iter::Iterator,
{
    match (iter.next(), iter.next(), iter.next()) {
        (Some(first), Some(second), None) => Ok((first, second)),
        (None, _, _) => Err(ExactlyTwoError::NoElements),
        (Some(_), None, _) => Err(ExactlyTwoError::OneElement),
        (Some(_), Some(_), Some(_)) => Err(ExactlyTwoError::ThreeOrMore),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      generic credentials                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// General-purpose credentials-- username & password, or key ID & secret key
///
/// In configuration, give these either as a two-element array (`["id", "secret"]`) or as a single
/// comma-separated string (`"id,secret"`).
// Not sure that the username should be secret, but why not?
#[derive(Clone, Debug)]
pub struct Credentials(pub (SecretString, SecretString));

#[derive(Deserialize)]
#[serde(untagged)]
enum CredentialsRepr {
    Pair(String, String),
    Joined(String),
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (id, secret) = match CredentialsRepr::deserialize(deserializer)? {
            CredentialsRepr::Pair(id, secret) => (id, secret),
            CredentialsRepr::Joined(text) => text
                .split(',')
                .pipe(exactly_two)
                .map_err(<D::Error as serde::de::Error>::custom)?
                .pipe(|(id, secret)| (id.to_owned(), secret.to_owned())),
        };
        Credentials((id.into(), secret.into())).pipe(Ok)
    }
}
