//! Serialize a [`Cid`] as its multibase string, for use with
//! `#[serde(with = "carquet_types::serde_cid")]`.

use std::str::FromStr;

use cid::Cid;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(cid)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Cid, D::Error> {
    let text = String::deserialize(deserializer)?;
    Cid::from_str(&text).map_err(D::Error::custom)
}

/// The same for `Option<Cid>`; `None` is `null`.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(cid: &Option<Cid>, serializer: S) -> Result<S::Ok, S::Error> {
        match cid {
            Some(cid) => serializer.collect_str(cid),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Cid>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| Cid::from_str(&text).map_err(D::Error::custom))
            .transpose()
    }
}
