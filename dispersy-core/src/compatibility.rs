//! Pairwise policy compatibility.
//!
//! Every meta-message is checked here when it is built. A combination that is
//! not allowed is a programming error in the community definition, reported as
//! a [`PolicyError`] before any traffic is possible.

use thiserror::Error;

use crate::policy::{Authentication, Destination, Distribution, Resolution};

/// An invalid meta-message definition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Two policy axes may not be combined.
    #[error("{first} does not support {second}")]
    Incompatible {
        /// The policy imposing the restriction.
        first: &'static str,
        /// The rejected partner.
        second: &'static str,
    },

    /// Multi-member messages cannot carry per-author sequence numbers.
    #[error("{0} may not be used with MultiMemberAuthentication when sequence numbers are enabled")]
    MultiMemberSequence(&'static str),

    /// A multi-member message needs at least one signer.
    #[error("MultiMemberAuthentication requires a positive signer count")]
    NoSigners,

    /// Last sync must keep at least one message.
    #[error("LastSyncDistribution requires a positive history size")]
    EmptyHistory,

    /// Application messages may not use the reserved prefix.
    #[error("message name {0:?} uses the reserved dispersy- prefix")]
    ReservedName(String),

    /// A meta-message with this name is already registered.
    #[error("message {0:?} is already registered")]
    DuplicateName(String),

    /// The payload does not belong to this meta-message.
    #[error("payload {payload} does not match message {message:?}")]
    PayloadMismatch {
        /// Meta-message name.
        message: String,
        /// Offending payload kind.
        payload: &'static str,
    },

    /// The per-message policy state does not match the meta-message.
    #[error("{0} state does not match the meta-message")]
    ImplementationMismatch(&'static str),
}

fn require(first: &'static str, second: &'static str, allowed: bool) -> Result<(), PolicyError> {
    if allowed {
        Ok(())
    } else {
        Err(PolicyError::Incompatible { first, second })
    }
}

/// Validate a combination of the four policy axes.
pub fn check_policy_combination(
    authentication: &Authentication,
    resolution: &Resolution,
    distribution: &Distribution,
    destination: &Destination,
) -> Result<(), PolicyError> {
    use Authentication as A;
    use Destination as T;
    use Distribution as D;
    use Resolution as R;

    let auth = authentication.name();
    let res = resolution.name();
    let dist = distribution.name();
    let dest = destination.name();

    match authentication {
        A::NoAuthentication => {
            require(auth, res, matches!(resolution, R::Public))?;
            require(auth, dist, matches!(distribution, D::Relay | D::Direct))?;
            require(
                auth,
                dest,
                matches!(destination, T::Address | T::Member | T::Community { .. }),
            )?;
        }
        A::Member { .. } => {}
        A::MultiMember { count, .. } => {
            if *count == 0 {
                return Err(PolicyError::NoSigners);
            }
        }
    }

    if let R::Linear = resolution {
        require(res, auth, !matches!(authentication, A::NoAuthentication))?;
    }

    match distribution {
        D::Relay => {
            require(dist, dest, matches!(destination, T::Address | T::Member))?;
        }
        D::Direct => {
            require(
                dist,
                dest,
                matches!(destination, T::Address | T::Member | T::Community { .. }),
            )?;
        }
        D::FullSync { .. } | D::LastSync { .. } => {
            require(dist, auth, !matches!(authentication, A::NoAuthentication))?;
            require(
                dist,
                dest,
                matches!(
                    destination,
                    T::Community { .. } | T::Subjective { .. } | T::Similarity { .. }
                ),
            )?;
            if matches!(authentication, A::MultiMember { .. }) && distribution.has_sequence_number()
            {
                return Err(PolicyError::MultiMemberSequence(dist));
            }
            if let D::LastSync { history_size: 0, .. } = distribution {
                return Err(PolicyError::EmptyHistory);
            }
        }
    }

    match destination {
        T::Address | T::Member => {
            require(dest, dist, matches!(distribution, D::Relay | D::Direct))?;
        }
        T::Community { .. } => {
            require(dest, dist, !matches!(distribution, D::Relay))?;
        }
        T::Subjective { .. } | T::Similarity { .. } => {
            require(dest, auth, !matches!(authentication, A::NoAuthentication))?;
            require(dest, dist, distribution.is_synced())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::KeyEncoding;

    fn member() -> Authentication {
        Authentication::Member {
            encoding: KeyEncoding::Mid,
        }
    }

    fn community() -> Destination {
        Destination::Community { node_count: 10 }
    }

    #[test]
    fn no_authentication_with_full_sync_is_rejected() {
        let err = check_policy_combination(
            &Authentication::NoAuthentication,
            &Resolution::Public,
            &Distribution::full_sync(),
            &community(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PolicyError::Incompatible {
                first: "NoAuthentication",
                second: "FullSyncDistribution"
            }
        );
    }

    #[test]
    fn no_authentication_requires_public_resolution() {
        assert!(check_policy_combination(
            &Authentication::NoAuthentication,
            &Resolution::Linear,
            &Distribution::Direct,
            &Destination::Address,
        )
        .is_err());
    }

    #[test]
    fn member_full_sync_community_is_valid() {
        check_policy_combination(
            &member(),
            &Resolution::Linear,
            &Distribution::full_sync(),
            &community(),
        )
        .unwrap();
    }

    #[test]
    fn multi_member_with_sequence_numbers_is_rejected() {
        let err = check_policy_combination(
            &Authentication::MultiMember {
                count: 2,
                allow_signature: None,
            },
            &Resolution::Public,
            &Distribution::FullSync {
                enable_sequence_number: true,
            },
            &community(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PolicyError::MultiMemberSequence("FullSyncDistribution")
        );
    }

    #[test]
    fn relay_only_reaches_addresses_and_members() {
        assert!(check_policy_combination(
            &member(),
            &Resolution::Public,
            &Distribution::Relay,
            &community(),
        )
        .is_err());
        check_policy_combination(
            &member(),
            &Resolution::Public,
            &Distribution::Relay,
            &Destination::Member,
        )
        .unwrap();
    }

    #[test]
    fn synced_messages_cannot_target_addresses() {
        assert!(check_policy_combination(
            &member(),
            &Resolution::Public,
            &Distribution::last_sync(1),
            &Destination::Address,
        )
        .is_err());
    }

    #[test]
    fn subjective_destination_requires_synced_distribution() {
        let subjective = Destination::Subjective {
            cluster: 1,
            node_count: 5,
        };
        assert!(check_policy_combination(
            &member(),
            &Resolution::Public,
            &Distribution::Direct,
            &subjective,
        )
        .is_err());
        check_policy_combination(
            &member(),
            &Resolution::Public,
            &Distribution::full_sync(),
            &subjective,
        )
        .unwrap();
    }

    #[test]
    fn zero_history_is_rejected() {
        assert_eq!(
            check_policy_combination(
                &member(),
                &Resolution::Public,
                &Distribution::last_sync(0),
                &community(),
            ),
            Err(PolicyError::EmptyHistory)
        );
    }

    #[test]
    fn multi_member_needs_signers() {
        assert_eq!(
            check_policy_combination(
                &Authentication::MultiMember {
                    count: 0,
                    allow_signature: None
                },
                &Resolution::Public,
                &Distribution::Direct,
                &Destination::Member,
            ),
            Err(PolicyError::NoSigners)
        );
    }
}
