//! # 变更通知模块
//!
//! 将就诊、清单、生命体征和文书的变更广播给所有订阅的工作站，
//! 并单独分发叫号事件。事件只携带触发重新拉取所需的信息，不含字段级差异。

pub mod events;
pub mod notifier;

pub use events::{ChangeEvent, ChangeKind, Collection, Notification, PageEvent};
pub use notifier::{ChangeNotifier, EventSink, NotifierConfig, PageSubscription, Subscription};
