//! Core crate for dwiflow: assembles hierarchical processing graphs for
//! post-processing preprocessed diffusion-MRI datasets. Graph
//! construction is pure and synchronous; execution is the job of an
//! external engine that receives the validated root workflow.

pub mod atlas;
pub mod cohort;
pub mod config;
pub mod derivatives;
pub mod discovery;
pub mod fanout;
pub mod graph;
pub mod logging;
pub mod node;
pub mod procedures;
