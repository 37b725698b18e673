pub(crate) mod driver;
pub(crate) mod maintenance;
pub(crate) mod registry;
