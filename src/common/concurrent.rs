pub(crate) mod constants;
pub(crate) mod thread_pool;
