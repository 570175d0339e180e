//! The concurrent tile pipeline: load tasks, cache residency, region
//! reconstruction, and viewport scheduling.
//!
//! [`loader`] owns the per-tile state machine and the worker-side task
//! bodies; [`region`] assembles arbitrary pixel rectangles from tiles;
//! [`viewport`] turns a camera rectangle into the wishlist the loader
//! consumes.

pub mod loader;
pub mod region;
pub mod viewport;

pub use loader::{LoadTileTask, Task, TileCompletion, TileRequest};
pub use region::{apply_level_window, PixelFormat};
pub use viewport::{plan_viewport, Viewport, ViewportPlan};
