// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.

use thiserror::Error;

use crate::conjury::ConjuryId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConjureError {
    #[error("inconsistent wait: `{waiter}` waits on `{target}`, already awaited by `{holder}`")]
    InconsistentWait {
        waiter: String,
        target: String,
        holder: String,
    },

    #[error("`{conjury}` cannot yield a `{value_type}`: not a generator of that type, or nobody is consuming")]
    InvalidYieldContext {
        conjury: String,
        value_type: &'static str,
    },

    #[error("`{conjury}` yielded again before its previous value was consumed")]
    TunnelOccupied { conjury: String },

    #[error("no live conjury with id {0}")]
    UnknownConjury(ConjuryId),

    #[error("conjury `{conjury}` panicked: {message}")]
    Panicked { conjury: String, message: String },

    #[error("deadlock: nothing runnable, {suspended} conjury(ies) suspended with no way to wake")]
    Deadlock { suspended: usize },
}

pub type Result<T> = std::result::Result<T, ConjureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_parties() {
        let err = ConjureError::InconsistentWait {
            waiter: "b".into(),
            target: "h".into(),
            holder: "a".into(),
        };
        assert_eq!(
            err.to_string(),
            "inconsistent wait: `b` waits on `h`, already awaited by `a`"
        );

        let err = ConjureError::UnknownConjury(ConjuryId::new(3, 1));
        assert_eq!(err.to_string(), "no live conjury with id 3v1");
    }
}
