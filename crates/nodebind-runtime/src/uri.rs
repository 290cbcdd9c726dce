use std::fmt;
use std::str::FromStr;

use crate::error::{BinderError, Result};
use crate::id::BinderId;

/// Scheme for references reached over the TCP wire transport.
pub const WIRE_SCHEME: &str = "rpc";

const INTERFACE_PREFIX: &str = "if=";

/// A reference to a binder: `scheme://<node>.<local>[/if=<descriptor>]`.
///
/// The scheme selects the transport plugin; the interface descriptor, when
/// present, names the typed proxy the reference can be turned into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinderUri {
    scheme: String,
    id: BinderId,
    interface: Option<String>,
}

impl BinderUri {
    pub fn new(scheme: impl Into<String>, id: BinderId) -> Self {
        Self {
            scheme: scheme.into(),
            id,
            interface: None,
        }
    }

    pub fn wire(id: BinderId) -> Self {
        Self::new(WIRE_SCHEME, id)
    }

    pub fn with_interface(mut self, descriptor: impl Into<String>) -> Self {
        self.interface = Some(descriptor.into());
        self
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| BinderError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path)),
            None => (rest, None),
        };
        let (node, local) = authority
            .split_once('.')
            .ok_or_else(|| invalid("authority must be <node>.<local>"))?;
        let node = node
            .parse::<u32>()
            .map_err(|_| invalid("node id is not a number"))?;
        let local = local
            .parse::<u32>()
            .map_err(|_| invalid("local id is not a number"))?;

        let interface = match path {
            None | Some("") => None,
            Some(path) => {
                let descriptor = path
                    .strip_prefix(INTERFACE_PREFIX)
                    .ok_or_else(|| invalid("path must be if=<descriptor>"))?;
                if descriptor.is_empty() {
                    return Err(invalid("empty interface descriptor"));
                }
                Some(descriptor.to_string())
            }
        };

        Ok(Self {
            scheme: scheme.to_string(),
            id: BinderId::new(node, local),
            interface,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn id(&self) -> BinderId {
        self.id
    }

    pub fn node_id(&self) -> u32 {
        self.id.node_id()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }
}

impl FromStr for BinderUri {
    type Err = BinderError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BinderUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.id)?;
        if let Some(descriptor) = &self.interface {
            write!(f, "/{INTERFACE_PREFIX}{descriptor}")?;
        }
        Ok(())
    }
}
