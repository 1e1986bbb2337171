//! Aggregates module
pub mod order;
pub mod appeal;
pub mod token;
pub mod state_delay;
pub mod license_key;
pub mod multi_item;

pub use order::{Order, FulfillmentChannel, ComboCatalog};
pub use appeal::{EarlyAppeal, AppealStatus, AppealAction, AppealDecision, TransitionError};
pub use token::{GetCidToken, TokenUsage, TokenSummary, select_token};
pub use state_delay::StateDelayEntry;
pub use license_key::LicenseKey;
pub use multi_item::{MultiItemOrder, MultiItemStatus, OrderLine};
