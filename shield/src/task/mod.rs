//! Background tasks owned by backends.

pub(crate) mod janitor;
