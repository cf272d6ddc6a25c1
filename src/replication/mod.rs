pub mod apply;
pub mod handler;
pub mod progress;

pub use apply::{apply_committed, AppliedCommand};
pub use handler::{handle_append_entries, handle_request_vote, reject_not_leader, Handled};
pub use progress::{FollowerCursor, ReplicationCursors};
