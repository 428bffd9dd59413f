mod dirty_flush;
mod entry_lifecycle;
pub(crate) mod utils;
