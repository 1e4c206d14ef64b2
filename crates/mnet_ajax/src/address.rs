//! Address codec: split an address into parts, merge query data, put it
//! back together.

use serde_json::{Map, Value};
use url::Url;

use crate::error::{DispatchError, Result};
use crate::value::to_host_string;

/// Structured form of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub scheme: String,
    pub username: String,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    /// Query pairs in address order.
    pub query: Vec<(String, String)>,
    pub fragment: Option<String>,
}

impl ParsedAddress {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Merge payload entries into the query. Payload keys override existing
    /// ones in place; new keys are appended.
    pub fn merge_query(&mut self, data: &Map<String, Value>) {
        for (key, value) in data {
            let value = to_host_string(value);
            match self.query.iter().position(|(k, _)| k == key) {
                Some(idx) => {
                    self.query[idx].1 = value;
                    // a key appears once after a merge
                    let mut seen = false;
                    self.query.retain(|(k, _)| {
                        if k != key {
                            return true;
                        }
                        let keep = !seen;
                        seen = true;
                        keep
                    });
                }
                None => self.query.push((key.clone(), value)),
            }
        }
    }
}

/// Parse an address into structured form and format it back.
pub trait AddressCodec: Send + Sync {
    fn parse(&self, address: &str) -> Result<ParsedAddress>;
    fn format(&self, parsed: &ParsedAddress) -> Result<String>;
}

/// Default codec over the `url` crate.
///
/// Relative addresses resolve against `base` when one is set. A
/// protocol-relative address (`//host/path`) without a base gets `https:`.
#[derive(Debug, Clone, Default)]
pub struct UrlCodec {
    base: Option<Url>,
}

impl UrlCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: &str) -> Result<Self> {
        Ok(Self {
            base: Some(Url::parse(base)?),
        })
    }

    fn resolve(&self, address: &str) -> Result<Url> {
        let parsed = Url::options().base_url(self.base.as_ref()).parse(address);
        match parsed {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) if address.starts_with("//") => {
                Ok(Url::parse(&format!("https:{address}"))?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl AddressCodec for UrlCodec {
    fn parse(&self, address: &str) -> Result<ParsedAddress> {
        let url = self.resolve(address)?;
        let host = url
            .host_str()
            .ok_or_else(|| DispatchError::InvalidAddress(address.to_string()))?
            .to_string();
        Ok(ParsedAddress {
            scheme: url.scheme().to_string(),
            username: url.username().to_string(),
            password: url.password().map(str::to_string),
            host,
            port: url.port(),
            path: url.path().to_string(),
            query: url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            fragment: url.fragment().map(str::to_string),
        })
    }

    fn format(&self, parsed: &ParsedAddress) -> Result<String> {
        let mut url = Url::parse(&format!("{}://{}", parsed.scheme, parsed.host))?;
        let bad_part = || DispatchError::InvalidAddress(parsed.host.clone());
        url.set_port(parsed.port).map_err(|_| bad_part())?;
        if !parsed.username.is_empty() {
            url.set_username(&parsed.username).map_err(|_| bad_part())?;
        }
        url.set_password(parsed.password.as_deref())
            .map_err(|_| bad_part())?;
        url.set_path(&parsed.path);
        if !parsed.query.is_empty() {
            url.query_pairs_mut().extend_pairs(parsed.query.iter());
        }
        url.set_fragment(parsed.fragment.as_deref());
        Ok(url.into())
    }
}
