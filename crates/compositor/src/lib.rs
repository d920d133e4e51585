//! Impasto compositor - layered image compositing and update scheduling
//!
//! This crate keeps a layer tree composited into a single projection:
//! - [`tiles`] - Copy-on-write tile store with undo mementos
//! - [`device`] - Paint devices over a tile store, iterators and painters
//! - [`node`] - Layer and mask tree, clones and per-node projection planes
//! - [`walker`] - Rect walkers that plan what a dirty rect touches
//! - [`merger`] - Executes a walk, compositing bottom-up into projections
//! - [`image`] - The document: tree, update queue, undo stack and signals
//! - [`scheduler`] - Background worker running strokes and updates
//! - [`commands`] - Undoable edits of the tree and its devices
//! - [`applicator`] - Stroke builder that brackets edits with updates

pub mod applicator;
pub mod color;
pub mod commands;
pub mod composite;
pub mod constants;
pub mod device;
pub mod filter;
pub mod generator;
pub mod geometry;
pub mod image;
pub mod merger;
pub mod node;
pub mod projection_leaf;
pub mod scheduler;
pub mod signals;
pub mod tiles;
pub mod walker;

pub use applicator::{ApplicatorFlags, NodeVisitor, ProcessingApplicator};
pub use color::{ChannelFlags, ColorSpace};
pub use commands::{CommandError, UndoCommand, UndoStack};
pub use composite::CompositeOp;
pub use constants::*;
pub use device::PaintDevice;
pub use filter::Filter;
pub use generator::Generator;
pub use geometry::Rect;
pub use image::{Image, ImageSnapshot};
pub use merger::{MergeError, MergeReport, Merger};
pub use node::{GraphError, Node, NodeFactory, NodeGraph, NodeId, NodeKind, NodeProperties, Subtree};
pub use scheduler::{StrokeError, StrokeId, StrokeJob, StrokeScheduler, StrokeState, StrokeStrategy};
pub use signals::{ImageSignal, SignalRouter};
pub use tiles::{Memento, TileError, TilePool};
