//! 网关：通知中枢与对外传输
//!
//! - `hub`：进程内通知中枢，按项目扇出事件信封，每连接有界发件箱与心跳
//! - `ws`：WebSocket 推送（订阅 / 退订 / 心跳）
//! - `http`：任务提交、轮询与仪表盘读取的 HTTP API

mod event;
mod hub;
#[cfg(feature = "server")]
pub mod http;
#[cfg(feature = "server")]
pub mod ws;

pub use event::{ClientMessage, Event, EventType};
pub use hub::{ConnectionId, HubMessage, NotificationHub, Subscription};
