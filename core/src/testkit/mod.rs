//! Test kit for the visibility pipeline
//!
//! Provides a fully wired community on in-memory stores so tests can focus
//! on grant changes and what each viewer receives.
//!
//! - `TestCommunity`: role store, membership service, grant registry, router
//!   and coordinator around one seeded community
//! - `Viewer`: a signed-in user with one live `LocalBroadcaster` connection
//! - `RecordingBroadcaster`: captures deliveries and room changes
//! - `StaticOracle`: eligibility oracle answering from an allow list
//!
//! # Example
//!
//! ```ignore
//! use commons_core::testkit::*;
//!
//! #[tokio::test]
//! async fn test_editor_sees_new_channel() {
//!     let community = TestCommunity::local().await.unwrap();
//!     let editor = community.custom_role("Editor").await.unwrap();
//!     let mut viewer = community.viewer(&[editor]).await.unwrap();
//!     // create a channel granted to `editor`, then inspect `viewer.drain()`
//! }
//! ```

mod community;
mod recording;

pub use community::{payload, StaticOracle, TestCommunity, Viewer};
pub use recording::{RecordingBroadcaster, RoomChange};
