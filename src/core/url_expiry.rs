/// Compares signed-URL expiry for manifest dedup (spec §6: "on dedup the
/// later-expiring URL wins").
///
/// URLs are expected to carry an `X-Amz-Expires`-style query parameter when
/// signed; unsigned or unparseable URLs are treated as never expiring
/// relative to a signed one they're compared against, since a plain URL has
/// no expiry to become stale.
pub fn expires_later(candidate: &str, current: &str) -> bool {
    match (expiry_of(candidate), expiry_of(current)) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

fn expiry_of(url: &str) -> Option<u64> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case("X-Amz-Expires"))
        .and_then(|(_, v)| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_expiry_wins() {
        assert!(expires_later(
            "https://cdn.test/a?X-Amz-Expires=200",
            "https://cdn.test/a?X-Amz-Expires=100"
        ));
        assert!(!expires_later(
            "https://cdn.test/a?X-Amz-Expires=50",
            "https://cdn.test/a?X-Amz-Expires=100"
        ));
    }

    #[test]
    fn signed_beats_unsigned() {
        assert!(expires_later(
            "https://cdn.test/a?X-Amz-Expires=50",
            "https://cdn.test/a"
        ));
    }

    #[test]
    fn unsigned_never_beats_anything() {
        assert!(!expires_later("https://cdn.test/a", "https://cdn.test/a?X-Amz-Expires=50"));
        assert!(!expires_later("https://cdn.test/a", "https://cdn.test/b"));
    }
}
