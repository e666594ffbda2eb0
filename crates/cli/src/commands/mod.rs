pub mod leases;
pub mod results;
pub mod tasks;
