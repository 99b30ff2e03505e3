pub mod datachannel;
pub mod duplex;
pub mod error;
pub mod facade;
pub mod ice;
pub mod ingest_handler;
pub mod participant;
pub mod participant_handler;
pub mod registry;
pub mod room;
pub mod sdp;
pub mod track;

pub use duplex::{DuplexFrame, SafeDuplexChannel};
pub use error::{DuplexError, FacadeError, HandlerError, RoomError};
pub use facade::WebRtcFacade;
pub use participant::{Participant, ParticipantState};
pub use registry::RoomRegistry;
pub use room::Room;
