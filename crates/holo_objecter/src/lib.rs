//! Client-side object request router.
//!
//! This crate turns "operate on object X" into requests addressed to the
//! storage node currently serving X, and keeps that routing correct while the
//! cluster map changes underneath outstanding requests. Callers supply a
//! `Transport` (and optionally a `PlacementResolver`), then drive requests
//! through `Objecter`.

pub mod objecter;
