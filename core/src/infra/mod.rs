//! Infrastructure layer: local storage and the outbox

pub mod db;
pub mod sync;
