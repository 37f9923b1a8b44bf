//! The session loop: a single-writer actor that serializes every
//! state change through one reducer.

pub mod events;
pub mod runtime;
pub mod state;
pub mod update;

pub use events::{ForegroundOutcome, SessionCommand, SessionEvent, UserCommand};
pub use runtime::{NullPresenter, Presenter, SessionHandle, SessionLoop};
pub use state::SessionState;
pub use update::update;
