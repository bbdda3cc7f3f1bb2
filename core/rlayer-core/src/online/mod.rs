//! Online index construction and consistency scrubbing: maintaining an
//! index against a live store without a single blocking transaction over
//! every record.

pub mod indexer;
pub mod scrubber;

pub use indexer::OnlineIndexer;
pub use scrubber::{OnlineIndexScrubber, ScrubIssue, ScrubReport};
