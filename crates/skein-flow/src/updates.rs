//! Real-time status updates published while a flow runs.

use uuid::Uuid;

#[derive(Clone, Debug)]
pub enum JobState {
    Running,
    Completed,
    Failed(String),
    Skipped,
}

#[derive(Clone, Debug)]
pub struct RunUpdate {
    pub uuid: Uuid,
    pub index: u32,
    pub name: String,
    pub state: JobState,
}
