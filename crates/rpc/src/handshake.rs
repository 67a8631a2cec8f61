//! Version, frame format and extension negotiation.
//!
//! The connecting node proposes, the accepting node selects, the connecting
//! node confirms. Messages are JSON since no frame format is agreed yet.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tether_transport::Connection;
use tracing::{debug, info, warn};

use crate::error::{CodecError, HandshakeError, Result};
use crate::extension::ExtensionIdentifier;
use crate::serialization::SerializationFormat;

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// An extension as advertised during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    /// Stable extension identifier.
    pub identifier: ExtensionIdentifier,
    /// Whether the peer must have the extension too.
    pub required: bool,
}

/// Opening message from the connecting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSelectionRequest {
    /// Versions the connecting node speaks.
    pub supported_versions: Vec<u32>,
    /// Proposed frame format.
    pub frame_format: SerializationFormat,
    /// Extensions of the connecting node.
    pub extensions: Vec<ExtensionDescriptor>,
}

/// The accepting node's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolSelectionResponse {
    /// Version selected, frame format accepted.
    Success {
        /// Selected version.
        version: u32,
        /// Extensions of the accepting node.
        extensions: Vec<ExtensionDescriptor>,
    },
    /// Negotiation failed.
    Error {
        /// Why.
        message: String,
    },
}

/// Final confirmation from the connecting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeComplete {
    /// Both sides agree.
    Success,
    /// The connecting node rejects the selection.
    Error {
        /// Why.
        message: String,
    },
}

/// Every message exchanged before the connection carries frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Connecting node proposes.
    Request(ProtocolSelectionRequest),
    /// Accepting node selects.
    Response(ProtocolSelectionResponse),
    /// Connecting node confirms.
    Complete(HandshakeComplete),
}

impl HandshakeMessage {
    const fn name(&self) -> &'static str {
        match self {
            Self::Request(_) => "Request",
            Self::Response(_) => "Response",
            Self::Complete(_) => "Complete",
        }
    }
}

/// What this node brings to a handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOffer {
    /// Versions this node speaks.
    pub versions: Vec<u32>,
    /// Frame format proposed when connecting.
    pub frame_format: SerializationFormat,
    /// Frame formats accepted when accepting.
    pub accepted_frame_formats: Vec<SerializationFormat>,
    /// This node's extensions.
    pub extensions: Vec<ExtensionDescriptor>,
}

/// The outcome both sides agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Protocol version in use.
    pub version: u32,
    /// Frame format in use.
    pub frame_format: SerializationFormat,
    /// Extensions the peer advertised.
    pub peer_extensions: Vec<ExtensionIdentifier>,
}

/// Highest version both lists contain.
#[must_use]
pub fn select_version(local: &[u32], remote: &[u32]) -> Option<u32> {
    local.iter().filter(|v| remote.contains(v)).max().copied()
}

/// Extensions `peer` requires that `local` lacks.
#[must_use]
pub fn missing_required(
    peer: &[ExtensionDescriptor],
    local: &[ExtensionDescriptor],
) -> Vec<ExtensionIdentifier> {
    peer.iter()
        .filter(|d| d.required)
        .filter(|d| !local.iter().any(|l| l.identifier == d.identifier))
        .map(|d| d.identifier.clone())
        .collect()
}

async fn send(connection: &dyn Connection, message: &HandshakeMessage) -> Result<()> {
    debug!("Sending handshake {}", message.name());
    let encoded =
        serde_json::to_vec(message).map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
    connection.send(Bytes::from(encoded)).await?;
    Ok(())
}

async fn recv(connection: &dyn Connection) -> Result<HandshakeMessage> {
    let bytes = connection.recv().await?;
    let message: HandshakeMessage = serde_json::from_slice(&bytes)
        .map_err(|e| HandshakeError::UnexpectedMessage(e.to_string()))?;
    debug!("Received handshake {}", message.name());
    Ok(message)
}

fn unexpected(expected: &str, actual: &HandshakeMessage) -> HandshakeError {
    HandshakeError::UnexpectedMessage(format!("expected {expected}, got {}", actual.name()))
}

/// Run the connecting side.
///
/// # Errors
///
/// Fails if the peers cannot agree, the peer rejects, or the connection
/// fails. The caller closes the connection.
pub async fn initiate(connection: &dyn Connection, offer: &HandshakeOffer) -> Result<Negotiated> {
    send(
        connection,
        &HandshakeMessage::Request(ProtocolSelectionRequest {
            supported_versions: offer.versions.clone(),
            frame_format: offer.frame_format,
            extensions: offer.extensions.clone(),
        }),
    )
    .await?;

    let (version, peer) = match recv(connection).await? {
        HandshakeMessage::Response(ProtocolSelectionResponse::Success {
            version,
            extensions,
        }) => (version, extensions),
        HandshakeMessage::Response(ProtocolSelectionResponse::Error { message }) => {
            warn!("Peer rejected handshake: {message}");
            return Err(HandshakeError::Rejected(message).into());
        }
        other => return Err(unexpected("Response", &other).into()),
    };

    let refusal = if offer.versions.contains(&version) {
        let missing = missing_required(&peer, &offer.extensions);
        if missing.is_empty() {
            None
        } else {
            Some(HandshakeError::MissingExtensions(missing))
        }
    } else {
        Some(HandshakeError::NoCommonVersion {
            local: offer.versions.clone(),
            remote: vec![version],
        })
    };

    if let Some(error) = refusal {
        warn!("Rejecting handshake: {error}");
        send(
            connection,
            &HandshakeMessage::Complete(HandshakeComplete::Error {
                message: error.to_string(),
            }),
        )
        .await?;
        return Err(error.into());
    }

    send(connection, &HandshakeMessage::Complete(HandshakeComplete::Success)).await?;
    info!(
        "Handshake complete on {}: version {version}, frames {}",
        connection.describe(),
        offer.frame_format
    );

    Ok(Negotiated {
        version,
        frame_format: offer.frame_format,
        peer_extensions: peer.into_iter().map(|d| d.identifier).collect(),
    })
}

/// Run the accepting side.
///
/// # Errors
///
/// Fails if the peers cannot agree, the peer rejects, or the connection
/// fails. The caller closes the connection.
pub async fn accept(connection: &dyn Connection, offer: &HandshakeOffer) -> Result<Negotiated> {
    let request = match recv(connection).await? {
        HandshakeMessage::Request(request) => request,
        other => return Err(unexpected("Request", &other).into()),
    };

    let selection = select_version(&offer.versions, &request.supported_versions)
        .ok_or_else(|| HandshakeError::NoCommonVersion {
            local: offer.versions.clone(),
            remote: request.supported_versions.clone(),
        })
        .and_then(|version| {
            if offer.accepted_frame_formats.contains(&request.frame_format)
                && request.frame_format.is_supported()
            {
                Ok(version)
            } else {
                Err(HandshakeError::UnsupportedFrameFormat(request.frame_format))
            }
        })
        .and_then(|version| {
            let missing = missing_required(&request.extensions, &offer.extensions);
            if missing.is_empty() {
                Ok(version)
            } else {
                Err(HandshakeError::MissingExtensions(missing))
            }
        });

    let version = match selection {
        Ok(version) => version,
        Err(error) => {
            warn!("Rejecting handshake: {error}");
            send(
                connection,
                &HandshakeMessage::Response(ProtocolSelectionResponse::Error {
                    message: error.to_string(),
                }),
            )
            .await?;
            return Err(error.into());
        }
    };

    send(
        connection,
        &HandshakeMessage::Response(ProtocolSelectionResponse::Success {
            version,
            extensions: offer.extensions.clone(),
        }),
    )
    .await?;

    match recv(connection).await? {
        HandshakeMessage::Complete(HandshakeComplete::Success) => {}
        HandshakeMessage::Complete(HandshakeComplete::Error { message }) => {
            warn!("Peer rejected handshake: {message}");
            return Err(HandshakeError::Rejected(message).into());
        }
        other => return Err(unexpected("Complete", &other).into()),
    }

    info!(
        "Handshake complete on {}: version {version}, frames {}",
        connection.describe(),
        request.frame_format
    );

    Ok(Negotiated {
        version,
        frame_format: request.frame_format,
        peer_extensions: request
            .extensions
            .into_iter()
            .map(|d| d.identifier)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, required: bool) -> ExtensionDescriptor {
        ExtensionDescriptor {
            identifier: ExtensionIdentifier::new(id),
            required,
        }
    }

    #[test]
    fn test_select_version_picks_highest_common() {
        assert_eq!(select_version(&[1, 2, 3], &[2, 3, 4]), Some(3));
        assert_eq!(select_version(&[1], &[1]), Some(1));
        assert_eq!(select_version(&[1, 2], &[3]), None);
        assert_eq!(select_version(&[], &[1]), None);
    }

    #[test]
    fn test_missing_required_ignores_optional() {
        let peer = vec![descriptor("a", true), descriptor("b", false), descriptor("c", true)];
        let local = vec![descriptor("a", false)];

        assert_eq!(
            missing_required(&peer, &local),
            vec![ExtensionIdentifier::new("c")]
        );
    }

    #[test]
    fn test_messages_are_json() {
        let message = HandshakeMessage::Response(ProtocolSelectionResponse::Success {
            version: 1,
            extensions: vec![descriptor("tether.session", true)],
        });

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["body"]["success"]["version"], 1);

        let decoded: HandshakeMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, message);
    }
}
