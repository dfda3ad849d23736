pub mod derivation;
pub mod grouping;
pub mod hash;
pub mod pipeline;
pub mod profile;
pub mod project;
pub mod proposals;
pub mod queue;
pub mod raster;
pub mod worker;
pub mod workflow;
