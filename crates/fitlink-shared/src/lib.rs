//! # fitlink-shared
//!
//! Domain types shared across the FitLink real-time coordination layer:
//! identifiers, connection/channel state, the Pusher-compatible wire frames,
//! decoded real-time events, the workout-invitation model, and the error
//! taxonomy.

pub mod constants;
pub mod error;
pub mod events;
pub mod invitation;
pub mod protocol;
pub mod types;

pub use error::{ApiError, FitlinkError, TransportError};
pub use events::RealtimeEvent;
pub use invitation::{Invitation, WorkoutPayload};
pub use types::{
    ChannelKind, ConnectionState, GroupId, InvitationId, LobbyChatMessage, LobbyState, SessionId,
    UserId,
};
