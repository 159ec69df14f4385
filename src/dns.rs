//! DNS identities for istiod revisions
//!
//! Each Istio revision runs its own istiod Service, so the certificate needs
//! one DNS SAN per revision. The `default` revision has no revision token in
//! its Service name.

/// Revision name that maps to the unqualified `istiod` Service
pub const DEFAULT_REVISION: &str = "default";

/// DNS name of the istiod Service for `revision` in `namespace`
pub fn revision_dns_name(namespace: &str, revision: &str) -> String {
    if revision == DEFAULT_REVISION {
        format!("istiod.{namespace}.svc")
    } else {
        format!("istiod{revision}.{namespace}.svc")
    }
}

/// Compute the common name and ordered DNS names for the istiod certificate
///
/// An empty revision list is treated as `["default"]`. Revision order is
/// preserved and duplicates pass through. `additional_dns_names` are appended
/// verbatim after the revision names.
///
/// The common name is always the default revision's name, even when
/// `default` is not among the revisions, to stay compatible with the static
/// istiod certificate shipped by the Helm chart. Issuers that require the
/// common name to appear in the SANs need `default` listed as a revision.
pub fn compute_names(
    namespace: &str,
    revisions: &[String],
    additional_dns_names: &[String],
) -> (String, Vec<String>) {
    let common_name = revision_dns_name(namespace, DEFAULT_REVISION);

    let mut dns_names: Vec<String> = if revisions.is_empty() {
        vec![common_name.clone()]
    } else {
        revisions
            .iter()
            .map(|revision| revision_dns_name(namespace, revision))
            .collect()
    };
    dns_names.extend(additional_dns_names.iter().cloned());

    (common_name, dns_names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_revisions_mean_default() {
        let (cn, dns) = compute_names("istio-system", &[], &[]);
        assert_eq!(cn, "istiod.istio-system.svc");
        assert_eq!(dns, strings(&["istiod.istio-system.svc"]));
    }

    #[test]
    fn revisions_keep_order_and_additional_names_follow() {
        let (cn, dns) = compute_names(
            "foo",
            &strings(&["default", "canary"]),
            &strings(&["extra.example.com"]),
        );
        assert_eq!(cn, "istiod.foo.svc");
        assert_eq!(
            dns,
            strings(&["istiod.foo.svc", "istiodcanary.foo.svc", "extra.example.com"])
        );
    }

    #[test]
    fn common_name_is_default_even_without_default_revision() {
        let (cn, dns) = compute_names("mesh", &strings(&["1-22", "1-23"]), &[]);
        assert_eq!(cn, "istiod.mesh.svc");
        assert_eq!(dns, strings(&["istiod1-22.mesh.svc", "istiod1-23.mesh.svc"]));
        assert!(!dns.contains(&cn));
    }

    #[test]
    fn duplicate_revisions_pass_through() {
        let (_, dns) = compute_names("ns", &strings(&["canary", "canary"]), &[]);
        assert_eq!(dns, strings(&["istiodcanary.ns.svc", "istiodcanary.ns.svc"]));
    }

    #[test]
    fn additional_names_are_appended_verbatim_with_empty_revisions() {
        let (_, dns) = compute_names("ns", &[], &strings(&["b.example.com", "a.example.com"]));
        assert_eq!(
            dns,
            strings(&["istiod.ns.svc", "b.example.com", "a.example.com"])
        );
    }
}
