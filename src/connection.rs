//! Connection generation and storage.
//!
//! A connection request is described by a rule ([`spec::ConnSpec`]) and a synapse
//! ([`spec::SynSpec`]). The [`builder`] turns it into concrete connections, stored per virtual
//! process in a [`table::ConnectionTable`] and read back through [`view::ConnectionView`]s.
pub mod builder;
pub mod spec;
pub mod table;
pub mod view;
