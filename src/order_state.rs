use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum OrderStatus {
    Created = 0,
    Paid = 1,
    Confirmed = 2,
    PaymentFailed = 3,
    /// Money captured, partner booking did not go through. Needs support.
    BookingFailed = 4,
    Cancelled = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("order cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl From<TransitionError> for ApiError {
    fn from(e: TransitionError) -> Self {
        ApiError::Conflict("INVALID_ORDER_STATE", e.to_string())
    }
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Paid => "paid",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::BookingFailed => "booking_failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        Some(match v {
            0 => OrderStatus::Created,
            1 => OrderStatus::Paid,
            2 => OrderStatus::Confirmed,
            3 => OrderStatus::PaymentFailed,
            4 => OrderStatus::BookingFailed,
            5 => OrderStatus::Cancelled,
            _ => return None,
        })
    }

    /// Money has been captured for the order.
    pub fn is_paid(self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Confirmed | OrderStatus::BookingFailed
        )
    }

    /// No further automatic transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::PaymentFailed | OrderStatus::BookingFailed | OrderStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Created, Paid)
                | (Created, PaymentFailed)
                | (Created, Cancelled)
                | (Paid, Confirmed)
                | (Paid, BookingFailed)
                | (Confirmed, Cancelled)
        )
    }

    pub fn transition(self, to: OrderStatus) -> Result<OrderStatus, TransitionError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OrderStatus::*;
    use super::*;

    const ALL: [OrderStatus; 6] = [Created, Paid, Confirmed, PaymentFailed, BookingFailed, Cancelled];

    #[test]
    fn happy_path_is_allowed() {
        assert_eq!(Created.transition(Paid), Ok(Paid));
        assert_eq!(Paid.transition(Confirmed), Ok(Confirmed));
    }

    #[test]
    fn paid_order_never_goes_back_to_unpaid() {
        for to in [Created, PaymentFailed] {
            assert!(!Paid.can_transition_to(to));
            assert!(!Confirmed.can_transition_to(to));
            assert!(!BookingFailed.can_transition_to(to));
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn self_transitions_are_rejected() {
        for s in ALL {
            assert!(!s.can_transition_to(s));
        }
    }

    #[test]
    fn i16_mapping_round_trips() {
        for s in ALL {
            assert_eq!(OrderStatus::from_i16(s as i16), Some(s));
        }
        assert_eq!(OrderStatus::from_i16(42), None);
    }

    #[test]
    fn transition_error_is_conflict() {
        let err: ApiError = Paid.transition(Created).unwrap_err().into();
        assert_eq!(err.code(), "INVALID_ORDER_STATE");
    }
}
