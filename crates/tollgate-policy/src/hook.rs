//! Lifecycle hook kinds and stream types.

use serde::{Deserialize, Serialize};

/// Direction of an exchange a chain runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// Client to upstream.
    OnRequest,
    /// Upstream to client.
    OnResponse,
}

impl StreamType {
    /// Returns the short name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnRequest => "request",
            Self::OnResponse => "response",
        }
    }

    /// The hook run at the start of this stream, before any body chunk.
    #[must_use]
    pub const fn lifecycle_hook(self) -> HookKind {
        match self {
            Self::OnRequest => HookKind::OnRequest,
            Self::OnResponse => HookKind::OnResponse,
        }
    }

    /// The hook producing a content stream for this stream's body.
    #[must_use]
    pub const fn content_hook(self) -> HookKind {
        match self {
            Self::OnRequest => HookKind::OnRequestContent,
            Self::OnResponse => HookKind::OnResponseContent,
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle or content hook a policy may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Request head, before the upstream is called.
    OnRequest,
    /// Response head, once the upstream answered.
    OnResponse,
    /// Request body chunks.
    OnRequestContent,
    /// Response body chunks.
    OnResponseContent,
}

impl HookKind {
    /// All hook kinds, in declaration order.
    pub const ALL: [HookKind; 4] = [
        Self::OnRequest,
        Self::OnResponse,
        Self::OnRequestContent,
        Self::OnResponseContent,
    ];

    /// Returns the hook name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OnRequest => "on_request",
            Self::OnResponse => "on_response",
            Self::OnRequestContent => "on_request_content",
            Self::OnResponseContent => "on_response_content",
        }
    }

    /// Returns true for body hooks.
    #[must_use]
    pub const fn is_content(self) -> bool {
        matches!(self, Self::OnRequestContent | Self::OnResponseContent)
    }

    /// Returns the stream this hook belongs to.
    #[must_use]
    pub const fn stream_type(self) -> StreamType {
        match self {
            Self::OnRequest | Self::OnRequestContent => StreamType::OnRequest,
            Self::OnResponse | Self::OnResponseContent => StreamType::OnResponse,
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
