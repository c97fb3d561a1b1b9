// ABOUTME: Validation of names and mount points supplied by plugins when configuring a sandbox
// ABOUTME: Rejects anything a backend could misinterpret before it reaches the engine

use hatch_runtime::MalformedPayloadError;
use regex::Regex;
use std::sync::LazyLock;

static ENV_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid env name pattern"));

static PROXY_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid proxy name pattern"));

/// Mount points must be absolute folder paths made of segments free of
/// characters that are illegal on Windows or macOS, and of NUL.
static MOUNT_POINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:/[^/\x00\\:*"<>|]+)+/$"#).expect("valid mount point pattern")
});

pub fn validate_env_name(name: &str) -> Result<(), MalformedPayloadError> {
    if !ENV_NAME_PATTERN.is_match(name) {
        return Err(MalformedPayloadError::new(format!(
            "environment variable name '{}' doesn't match: {}",
            name,
            ENV_NAME_PATTERN.as_str()
        )));
    }
    Ok(())
}

pub fn validate_proxy_name(hostname: &str) -> Result<(), MalformedPayloadError> {
    if !PROXY_NAME_PATTERN.is_match(hostname) {
        return Err(MalformedPayloadError::new(format!(
            "proxy hostname '{}' is not allowed, the hostname must match: {}",
            hostname,
            PROXY_NAME_PATTERN.as_str()
        )));
    }
    Ok(())
}

/// Validates a mount point
///
/// Checks that the mount point:
/// - Is absolute
/// - Ends with a slash (only folders are mounted)
/// - Contains only allowed characters
/// - Has no `.` or `..` segments
pub fn validate_mount_point(mount_point: &str) -> Result<(), MalformedPayloadError> {
    if !mount_point.starts_with('/') {
        return Err(MalformedPayloadError::new(format!(
            "mount-point '{}' does not start with slash, all mount-points must be absolute",
            mount_point
        )));
    }

    if !mount_point.ends_with('/') {
        return Err(MalformedPayloadError::new(format!(
            "mount-point '{}' does not end with slash, mount-points must end with a slash to indicate a folder",
            mount_point
        )));
    }

    if !MOUNT_POINT_PATTERN.is_match(mount_point) {
        return Err(MalformedPayloadError::new(format!(
            "mount-point '{}' is not allowed, mount-points must match: {}",
            mount_point,
            MOUNT_POINT_PATTERN.as_str()
        )));
    }

    if mount_point.contains("/./") || mount_point.contains("/../") {
        return Err(MalformedPayloadError::new(format!(
            "mount-point '{}' may not contain '/./' or '/../'",
            mount_point
        )));
    }

    Ok(())
}

/// Two validated mount points overlap when they are equal or one is a
/// folder inside the other. Both end in `/`, so a plain prefix test is a
/// directory-prefix test.
pub fn mount_points_overlap(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("PATH")]
    #[case("my_var-2")]
    fn test_valid_env_names(#[case] name: &str) {
        assert!(validate_env_name(name).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("A=B")]
    #[case("with space")]
    #[case("dollar$")]
    fn test_invalid_env_names(#[case] name: &str) {
        assert!(validate_env_name(name).is_err());
    }

    #[rstest]
    #[case("/data/")]
    #[case("/home/worker/.cache/")]
    #[case("/a/b/c/")]
    fn test_valid_mount_points(#[case] mount_point: &str) {
        assert!(validate_mount_point(mount_point).is_ok(), "{}", mount_point);
    }

    #[rstest]
    #[case("relative/")]
    #[case("/a")]
    #[case("/")]
    #[case("//")]
    #[case("/a/./b/")]
    #[case("/a/../b/")]
    #[case("/../")]
    #[case("/a:b/")]
    #[case("/a\\b/")]
    #[case("/nul\0/")]
    #[case("/star*/")]
    fn test_invalid_mount_points(#[case] mount_point: &str) {
        assert!(validate_mount_point(mount_point).is_err(), "{:?}", mount_point);
    }

    #[rstest]
    #[case("/data/", "/data/", true)]
    #[case("/data/", "/data/sub/", true)]
    #[case("/data/sub/", "/data/", true)]
    #[case("/data/", "/database/", false)]
    #[case("/a/", "/b/", false)]
    fn test_overlap(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        assert_eq!(mount_points_overlap(a, b), expected);
    }
}
