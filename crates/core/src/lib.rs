//! eq8comp core: effect state, replication protocol, routing and pipelines

pub mod domain;
