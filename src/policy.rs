use crate::config::Resource;
use crate::token::{string_claim, strings_claim, Identity};
use regex::Regex;

/// Membership check shared by the role and group predicates.
///
/// Empty requirements always permit. With `require_all` every required
/// entry must be held, otherwise one match suffices.
pub(crate) fn has_access(required: &[String], held: &[String], require_all: bool) -> bool {
    if required.is_empty() {
        return true;
    }
    if require_all {
        required.iter().all(|needed| held.contains(needed))
    } else {
        required.iter().any(|needed| held.contains(needed))
    }
}

/// Match one configured claim requirement against the identity.
///
/// String claims match the pattern directly; list claims match when any
/// element does. Any other claim shape denies.
pub(crate) fn check_claim(identity: &Identity, claim: &str, pattern: &Regex, resource_url: &str) -> bool {
    if !identity.claims.contains_key(claim) {
        log::warn!(
            "token does not have the claim, access=denied claim={claim} email={} resource={resource_url}",
            identity.email
        );
        return false;
    }

    if let Ok(Some(value)) = string_claim(&identity.claims, claim) {
        if pattern.is_match(&value) {
            return true;
        }
        log::warn!(
            "claim requirement does not match claim in token, access=denied claim={claim} issued={value} required={pattern} resource={resource_url}",
        );
        return false;
    }

    if let Ok(Some(values)) = strings_claim(&identity.claims, claim) {
        if values.iter().any(|value| pattern.is_match(value)) {
            return true;
        }
        log::warn!(
            "claim requirement does not match any claim in token, access=denied claim={claim} issued={values:?} required={pattern} resource={resource_url}",
        );
        return false;
    }

    log::warn!(
        "unable to extract the claim from token, access=denied claim={claim} resource={resource_url}",
    );
    false
}

/// Admission decision for one resource. Deterministic over the identity's
/// roles, groups and claims only.
pub(crate) fn allow(
    resource: &Resource,
    identity: &Identity,
    claim_matches: &[(String, Regex)],
) -> bool {
    if resource.whitelisted {
        return true;
    }
    if !has_access(&resource.roles, &identity.roles, !resource.require_any_role) {
        return false;
    }
    // group membership is always all-of
    if !has_access(&resource.groups, &identity.groups, true) {
        return false;
    }
    claim_matches
        .iter()
        .all(|(claim, pattern)| check_claim(identity, claim, pattern, &resource.url))
}
