pub mod async_task;
pub mod backoff;
pub mod time;
