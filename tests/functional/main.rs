#[cfg(feature = "functional-tests")]
mod cluster;

#[cfg(feature = "functional-tests")]
mod resources;

#[cfg(feature = "functional-tests")]
mod hierarchy;

#[cfg(feature = "functional-tests")]
mod propagation;

#[cfg(feature = "functional-tests")]
pub use cluster::TestCluster;

#[cfg(feature = "functional-tests")]
pub use resources::TestResources;
