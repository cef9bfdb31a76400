//! Stream id components
//!
//! Parses and builds access-control style stream ids of the form
//! `#!::r=resource,u=user,m=publish,...`. A stream id without the `#!::`
//! prefix names the resource directly.

use std::fmt;
use std::str::FromStr;

use crate::engine::validate_stream_id;
use crate::error::Error;

/// Prefix marking a key/value stream id.
pub const ACCESS_CONTROL_PREFIX: &str = "#!::";

/// What the caller intends to do with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    #[default]
    Request,
    Publish,
    Bidirectional,
}

impl StreamMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Publish => "publish",
            Self::Bidirectional => "bidirectional",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "request" => Some(Self::Request),
            "publish" => Some(Self::Publish),
            "bidirectional" => Some(Self::Bidirectional),
            _ => None,
        }
    }
}

/// Kind of payload carried by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Stream,
    File,
    Auth,
}

impl StreamType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::File => "file",
            Self::Auth => "auth",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "stream" => Some(Self::Stream),
            "file" => Some(Self::File),
            "auth" => Some(Self::Auth),
            _ => None,
        }
    }
}

/// Decoded stream id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamIdComponents {
    pub resource: Option<String>,
    pub user: Option<String>,
    pub mode: StreamMode,
    pub host: Option<String>,
    pub kind: StreamType,
    pub session: Option<String>,
    /// Unrecognised keys in the order they appeared
    pub extras: Vec<(String, String)>,
}

impl StreamIdComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of an unrecognised key.
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an unrecognised key, replacing an earlier value in place.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.extras.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.extras.push((key, value)),
        }
    }

    /// A `h` value may carry the resource as a path suffix.
    fn set_host(&mut self, value: &str, explicit_resource: bool) {
        match value.split_once('/') {
            Some((host, path)) => {
                self.host = Some(host.to_string());
                if !explicit_resource {
                    self.resource = Some(path.to_string());
                }
            }
            None => self.host = Some(value.to_string()),
        }
    }

    fn merge_pairs(&mut self, body: &str) {
        let pairs: Vec<(&str, &str)> = body
            .split(',')
            .filter_map(|item| item.split_once('='))
            .filter(|(key, value)| !key.is_empty() && !value.is_empty())
            .collect();
        // an explicit resource wins over a host path regardless of order
        let explicit_resource = pairs.iter().any(|(key, _)| *key == "r");

        for (key, value) in pairs {
            match key {
                "r" => self.resource = Some(value.to_string()),
                "u" => self.user = Some(value.to_string()),
                "m" => {
                    if let Some(mode) = StreamMode::parse(value) {
                        self.mode = mode;
                    }
                }
                "h" => self.set_host(value, explicit_resource),
                "t" => {
                    if let Some(kind) = StreamType::parse(value) {
                        self.kind = kind;
                    }
                }
                "s" => self.session = Some(value.to_string()),
                _ => self.set_extra(key, value),
            }
        }
    }
}

impl FromStr for StreamIdComponents {
    type Err = Error;

    fn from_str(stream_id: &str) -> Result<Self, Self::Err> {
        validate_stream_id(stream_id)?;
        let mut components = Self::default();
        match stream_id.strip_prefix(ACCESS_CONTROL_PREFIX) {
            Some(body) => components.merge_pairs(body),
            None if stream_id.is_empty() => {}
            None => components.resource = Some(stream_id.to_string()),
        }
        Ok(components)
    }
}

impl fmt::Display for StreamIdComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut vars: Vec<String> = Vec::new();
        if let Some(ref resource) = self.resource {
            vars.push(format!("r={resource}"));
        }
        if let Some(ref user) = self.user {
            vars.push(format!("u={user}"));
        }
        vars.push(format!("m={}", self.mode.as_str()));
        if let Some(ref host) = self.host {
            vars.push(format!("h={host}"));
        }
        vars.push(format!("t={}", self.kind.as_str()));
        if let Some(ref session) = self.session {
            vars.push(format!("s={session}"));
        }
        for (key, value) in &self.extras {
            vars.push(format!("{key}={value}"));
        }
        write!(f, "{ACCESS_CONTROL_PREFIX}{}", vars.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(stream_id: &str) -> StreamIdComponents {
        stream_id.parse().unwrap()
    }

    #[test]
    fn test_defaults() {
        let components = StreamIdComponents::new();
        assert_eq!(components.mode, StreamMode::Request);
        assert_eq!(components.kind, StreamType::Stream);
        assert!(components.resource.is_none());
    }

    #[test]
    fn test_plain_stream_id_is_resource() {
        let components = parse("mystream00");
        assert_eq!(components.resource.as_deref(), Some("mystream00"));
        assert!(components.user.is_none());
        assert!(components.host.is_none());
        assert!(components.session.is_none());
        assert_eq!(components.mode, StreamMode::Request);
        assert_eq!(components.kind, StreamType::Stream);
        assert!(components.extras.is_empty());
    }

    #[test]
    fn test_access_control_keys() {
        let components = parse("#!::r=foobar,u=admin,h=stream.recce.nl,s=12345,t=stream,m=publish");
        assert_eq!(components.resource.as_deref(), Some("foobar"));
        assert_eq!(components.user.as_deref(), Some("admin"));
        assert_eq!(components.mode, StreamMode::Publish);
        assert_eq!(components.host.as_deref(), Some("stream.recce.nl"));
        assert_eq!(components.kind, StreamType::Stream);
        assert_eq!(components.session.as_deref(), Some("12345"));
    }

    #[test]
    fn test_type_and_mode_values() {
        assert_eq!(parse("#!::t=file").kind, StreamType::File);
        assert_eq!(parse("#!::t=auth").kind, StreamType::Auth);
        assert_eq!(parse("#!::t=foo").kind, StreamType::Stream);
        assert_eq!(parse("#!::m=bidirectional").mode, StreamMode::Bidirectional);
        assert_eq!(parse("#!::m=sideways").mode, StreamMode::Request);
    }

    #[test]
    fn test_host_path_becomes_resource() {
        let components = parse("#!::h=stream.recce.nl/my/movie.ts");
        assert_eq!(components.host.as_deref(), Some("stream.recce.nl"));
        assert_eq!(components.resource.as_deref(), Some("my/movie.ts"));

        for stream_id in [
            "#!::r=foo,h=stream.recce.nl/my/movie.ts",
            "#!::h=stream.recce.nl/my/movie.ts,r=foo",
        ] {
            assert_eq!(parse(stream_id).resource.as_deref(), Some("foo"));
        }
    }

    #[test]
    fn test_unknown_keys_are_extras() {
        let mut components = parse("#!::foo=bar,zed=1");
        assert_eq!(components.extra("foo"), Some("bar"));
        assert_eq!(components.extra("nope"), None);

        components.set_extra("foo", "baz");
        assert_eq!(
            components.extras,
            vec![("foo".into(), "baz".into()), ("zed".into(), "1".into())]
        );
    }

    #[test]
    fn test_display_builds_access_control_form() {
        let mut components = StreamIdComponents {
            resource: Some("myresource".into()),
            user: Some("emma".into()),
            mode: StreamMode::Publish,
            host: Some("stream2.recce.nl".into()),
            kind: StreamType::File,
            session: Some("bcde".into()),
            extras: Vec::new(),
        };
        components.set_extra("baz", "bar");

        let stream_id = components.to_string();
        assert_eq!(
            stream_id,
            "#!::r=myresource,u=emma,m=publish,h=stream2.recce.nl,t=file,s=bcde,baz=bar"
        );
        assert_eq!(parse(&stream_id), components);
    }

    #[test]
    fn test_overlong_stream_id() {
        let err = "x".repeat(513).parse::<StreamIdComponents>().unwrap_err();
        assert!(err.is_invalid_argument());
        assert!("x".repeat(512).parse::<StreamIdComponents>().is_ok());
    }
}
