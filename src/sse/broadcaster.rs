use crate::sse::models::{ChangeSender, PresenceSender};
use tokio::sync::broadcast;

pub fn create_change_broadcaster() -> ChangeSender {
    let (tx, _rx) = broadcast::channel(256);
    tx
}

pub fn create_presence_broadcaster() -> PresenceSender {
    let (tx, _rx) = broadcast::channel(256);
    tx
}
