//! Port for delivering verification messages to a contact.
//!
//! Delivery mechanics (SMTP, SMS gateways) live entirely behind this port; the
//! domain only hands over the contact and the rendered message.

use async_trait::async_trait;

use crate::domain::Contact;

use super::define_port_error;

define_port_error! {
    /// Errors raised by notification adapters.
    pub enum NotificationError {
        /// The message could not be handed to the delivery channel.
        Delivery { message: String } => "notification delivery failed: {message}",
    }
}

/// Outbound notification port.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Send `message` to `contact`.
    async fn send(&self, contact: &Contact, message: &str) -> Result<(), NotificationError>;
}
