//! Order access control

use crate::directory::OrderRecord;
use crate::session::{Role, Session};

/// Whether a session may observe an order: its customer, its assigned
/// driver, or any admin.
pub fn can_access_order(session: &Session, order: &OrderRecord) -> bool {
    let Some(identity) = session.identity.as_ref() else {
        return false;
    };

    match identity.role {
        Role::Admin => true,
        Role::Customer => order.customer_id == identity.user_id,
        Role::Driver => is_assigned_driver(session, order),
    }
}

/// Whether a session is the driver currently assigned to an order
pub fn is_assigned_driver(session: &Session, order: &OrderRecord) -> bool {
    match (session.driver_id(), order.driver_id()) {
        (Some(session_driver), Some(order_driver)) => session_driver == order_driver,
        _ => false,
    }
}
