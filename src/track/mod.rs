//! Track publications and roster reconciliation

pub mod publication;
pub mod reconciler;

pub use publication::{
    new_cid, LocalPublication, LocalTrack, PendingPublication, RemotePublication, TrackId,
};
pub use reconciler::TrackReconciler;
