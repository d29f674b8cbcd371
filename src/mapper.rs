//! Field mapping from Stack specs to engine requests
//!
//! Pure functions. The only fallible step is parsing the static default tag
//! string, which happens once at startup.

use std::collections::BTreeMap;

use crate::provider::{Parameter, Tag};
use crate::{Error, Result, SENTINEL_TAG_KEY, SENTINEL_TAG_VALUE};

/// Tag identifying this controller as the owner of a stack
pub fn sentinel_tag() -> Tag {
    Tag::new(SENTINEL_TAG_KEY, SENTINEL_TAG_VALUE)
}

/// Parse a `key:value,key:value` default tag string
///
/// Entries are trimmed and empty entries skipped. The first `:` separates
/// key from value, so values may contain colons (ARNs, URLs).
pub fn parse_default_tags(raw: Option<&str>) -> Result<Vec<Tag>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Tag::new(key.trim(), value.trim()))
            }
            _ => Err(Error::config(
                "DEFAULT_TAGS",
                format!("entry '{entry}' is not key:value"),
            )),
        })
        .collect()
}

/// Merge tags in append order: sentinel, defaults, then user tags
///
/// Duplicate keys are kept. The engine resolves collisions, and since user
/// tags come last their values win.
pub fn merge_tags(defaults: &[Tag], user: Option<&BTreeMap<String, String>>) -> Vec<Tag> {
    let mut tags = Vec::with_capacity(1 + defaults.len() + user.map_or(0, BTreeMap::len));
    tags.push(sentinel_tag());
    tags.extend_from_slice(defaults);
    if let Some(user) = user {
        tags.extend(user.iter().map(|(k, v)| Tag::new(k, v)));
    }
    tags
}

/// Map spec parameters, omitting them entirely when there are none
pub fn map_parameters(params: Option<&BTreeMap<String, String>>) -> Option<Vec<Parameter>> {
    let params = params.filter(|p| !p.is_empty())?;
    Some(
        params
            .iter()
            .map(|(k, v)| Parameter {
                key: k.clone(),
                value: v.clone(),
            })
            .collect(),
    )
}

/// Split the static capability list, omitting it when empty
pub fn map_capabilities(raw: Option<&str>) -> Option<Vec<String>> {
    let caps: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    (!caps.is_empty()).then_some(caps)
}
