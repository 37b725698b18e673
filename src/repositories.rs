pub(crate) mod session_cache;
