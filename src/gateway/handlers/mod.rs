pub(crate) mod jobs;
pub(crate) mod queue;
pub(crate) mod status;
