pub(crate) mod alloc;
pub(crate) mod concurrent;
pub(crate) mod epoch;
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test_utils;
