//! Reply types of the scraped portal's AJAX endpoints.
//!
//! The portal sends `false` where other APIs would send `null`, so optional
//! fields go through `OrFalse`.

use serde::Deserialize;
use std::collections::HashMap;

/// A value, or the literal `false` standing in for "absent"
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum OrFalse<T> {
    Value(T),
    Flag(bool),
}

/// Flattens an optional `OrFalse` field into a plain `Option`
pub(super) fn present<T>(field: Option<OrFalse<T>>) -> Option<T> {
    match field {
        Some(OrFalse::Value(value)) => Some(value),
        _ => None,
    }
}

/// Reply of `action=get_episodes`
#[derive(Debug, Deserialize)]
pub(super) struct EpisodesReply {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// HTML fragment with the season tab list
    #[serde(default)]
    pub seasons: Option<OrFalse<String>>,
    /// HTML fragment with the episode tab list
    #[serde(default)]
    pub episodes: Option<OrFalse<String>>,
}

/// Reply of `action=get_stream` and `action=get_movie`
#[derive(Debug, Deserialize)]
pub(super) struct StreamReply {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// The (possibly obfuscated) manifest
    #[serde(default)]
    pub url: Option<OrFalse<String>>,
    /// `[Language]url` list
    #[serde(default)]
    pub subtitle: Option<OrFalse<String>>,
    /// Language label -> code table
    #[serde(default)]
    pub subtitle_lns: Option<OrFalse<HashMap<String, String>>>,
}
