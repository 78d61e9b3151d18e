//! FCP 2.0 messages.
//!
//! A message is a name line, `Field=Value` lines and a terminator. Messages
//! carrying a payload end in `Data` followed by `DataLength` raw bytes;
//! all others end in `EndMessage`.

use bytes::Bytes;

use crate::error::StoreError;

/// One FCP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpMessage {
    pub name: String,
    /// Fields in wire order.
    pub fields: Vec<(String, String)>,
    pub data: Option<Bytes>,
}

impl FcpMessage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            data: None,
        }
    }

    /// Builder-style field setter.
    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set(name, value);
        self
    }

    /// Attach trailing data.
    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    /// Set a field, replacing an existing value.
    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        let value = value.to_string();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(field, _)| field == name).map(|(_, value)| value.as_str())
    }

    pub fn identifier(&self) -> Option<&str> {
        self.get("Identifier")
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name)?.parse().ok()
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        self.get(name)?.parse().ok()
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Map a failure message (`PutFailed`, `GetFailed`, `ProtocolError`) to
    /// a store error.
    pub fn to_error(&self, uri: &str) -> StoreError {
        use crate::constants::*;

        let code = self.get_u32("Code").unwrap_or(0);
        let description = self
            .get("CodeDescription")
            .or_else(|| self.get("ExtraDescription"))
            .unwrap_or("no description")
            .to_string();

        if self.name == "ProtocolError" {
            return StoreError::Protocol {
                message: format!("{description} (code {code})"),
            };
        }

        match code {
            FCP_CODE_COLLISION if self.name == "PutFailed" => StoreError::Collision {
                uri: self.get("ExpectedURI").unwrap_or(uri).to_string(),
            },
            FCP_CODE_DATA_NOT_FOUND | FCP_CODE_ROUTE_NOT_FOUND | FCP_CODE_ALL_DATA_NOT_FOUND
                if self.name == "GetFailed" =>
            {
                StoreError::NotFound { uri: uri.to_string() }
            }
            FCP_CODE_TOO_BIG if self.name == "GetFailed" => StoreError::TooLarge {
                size: self.get_u64("ExpectedDataLength").unwrap_or(0),
                max: 0,
            },
            FCP_CODE_PERMANENT_REDIRECT if self.name == "GetFailed" => StoreError::Redirect {
                uri: self.get("RedirectURI").unwrap_or(uri).to_string(),
            },
            _ => StoreError::Failed { code, description },
        }
    }
}
