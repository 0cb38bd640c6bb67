use std::num::NonZeroUsize;

use qgemm::env::{parse_bool, parse_capacity};
use qgemm::qgemm::{CachePolicy, QgemmConfig};

#[test]
fn parse_bool_accepts_common_spellings() {
    for value in ["1", "true", "TRUE", " yes ", "On"] {
        assert!(parse_bool(value), "{value:?} should parse as true");
    }
    for value in ["0", "false", "no", "off", "", "maybe"] {
        assert!(!parse_bool(value), "{value:?} should parse as false");
    }
}

#[test]
fn parse_capacity_treats_zero_and_garbage_as_unbounded() {
    assert_eq!(parse_capacity("64"), NonZeroUsize::new(64));
    assert_eq!(parse_capacity(" 8 "), NonZeroUsize::new(8));
    assert_eq!(parse_capacity("0"), None);
    assert_eq!(parse_capacity("-3"), None);
    assert_eq!(parse_capacity("lots"), None);
}

#[test]
fn cache_policy_from_capacity() {
    assert_eq!(CachePolicy::from_capacity(None), CachePolicy::Unbounded);
    let capacity = NonZeroUsize::new(16).unwrap();
    assert_eq!(
        CachePolicy::from_capacity(Some(capacity)),
        CachePolicy::Lru { capacity }
    );
}

#[test]
fn default_config_enables_fused_with_unbounded_caches() {
    let config = QgemmConfig::default();
    assert!(config.fused_enabled);
    assert_eq!(config.descriptor_cache, CachePolicy::Unbounded);
    assert_eq!(config.scale_cache, CachePolicy::Unbounded);

    let tuned = config
        .with_fused_enabled(false)
        .with_scale_cache(CachePolicy::Lru {
            capacity: NonZeroUsize::new(4).unwrap(),
        });
    assert!(!tuned.fused_enabled);
    assert_eq!(tuned.descriptor_cache, CachePolicy::Unbounded);

    let json = serde_json::to_value(tuned).unwrap();
    assert_eq!(json["fused_enabled"], false);
    assert_eq!(json["scale_cache"]["Lru"]["capacity"], 4);
}
