pub mod connection;
pub mod derive;
pub mod event;
pub mod model;
pub mod reconciler;
pub mod transport;

pub use connection::{Activity, CloseReason, ConnectionManager};
pub use derive::DerivedView;
pub use model::{MatchId, MatchSnapshot};
pub use reconciler::{Applied, Reconciler, ReconcilerOptions};
pub use transport::{Connector, WsConnector};
