pub mod network;
pub mod notification;
pub mod response;
pub mod subscription;
pub mod transaction;
pub mod verification;
pub mod wallet;

pub use network::*;
pub use notification::*;
pub use response::*;
pub use subscription::*;
pub use transaction::*;
pub use verification::*;
pub use wallet::*;
