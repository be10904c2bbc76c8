//! Spec validation and secret normalization.

use std::collections::HashSet;

use convoy_agent_api::MountKind;
use convoy_id::SecretId;
use convoy_secrets::SecretFileTarget;

use super::StoreError;
use crate::model::{MountRequest, SecretReference, SecretRequest, ServiceSpec};

const MAX_NAME_LEN: usize = 63;

/// Upper bound on `replicas`. The reconciler walks every slot on each sweep.
pub const MAX_REPLICAS: u64 = 10_000;

/// Object names: 1-63 chars, alphanumeric first, then `[A-Za-z0-9_.-]`.
pub fn validate_name(field: &str, name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::validation(field, "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::validation(
            field,
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(StoreError::validation(
            field,
            "must start with a letter or digit",
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(StoreError::validation(
            field,
            "may only contain letters, digits, '_', '.' and '-'",
        ));
    }
    Ok(())
}

/// Check everything about a spec that does not need the store.
pub fn validate_spec(spec: &ServiceSpec) -> Result<(), StoreError> {
    validate_name("name", &spec.name)?;

    if spec.replicas > MAX_REPLICAS {
        return Err(StoreError::validation(
            "replicas",
            format!("must be at most {MAX_REPLICAS}"),
        ));
    }

    let container = &spec.task_template.container;
    if container.image.trim().is_empty() {
        return Err(StoreError::validation(
            "task_template.container.image",
            "must not be empty",
        ));
    }

    let mut targets = HashSet::new();
    for (i, mount) in container.mounts.iter().enumerate() {
        let field = format!("task_template.container.mounts[{i}]");
        validate_mount(&field, mount)?;
        if !targets.insert(normalize_path(&mount.target)) {
            return Err(StoreError::validation(
                field,
                format!("duplicate mount point '{}'", mount.target),
            ));
        }
    }

    Ok(())
}

fn validate_mount(field: &str, mount: &MountRequest) -> Result<(), StoreError> {
    if !mount.target.starts_with('/') {
        return Err(StoreError::validation(
            field,
            format!("target '{}' must be an absolute path", mount.target),
        ));
    }
    if normalize_path(&mount.target) == "/" {
        return Err(StoreError::validation(field, "cannot mount over '/'"));
    }

    let source = mount.source.as_deref().filter(|s| !s.is_empty());
    match (mount.kind, source) {
        (MountKind::Bind, None) => Err(StoreError::validation(
            field,
            "bind mounts require a source",
        )),
        (MountKind::Bind, Some(src)) if !src.starts_with('/') => Err(StoreError::validation(
            field,
            format!("bind source '{src}' must be an absolute path"),
        )),
        (MountKind::Tmpfs, Some(_)) => Err(StoreError::validation(
            field,
            "tmpfs mounts must not have a source",
        )),
        (MountKind::Volume, Some(name)) => validate_name(field, name),
        _ => Ok(()),
    }
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Resolve secret requests by name and fill in file defaults.
pub fn normalize_secrets<F>(
    requests: &[SecretRequest],
    lookup: F,
) -> Result<Vec<SecretReference>, StoreError>
where
    F: Fn(&str) -> Option<SecretId>,
{
    let mut file_names = HashSet::new();
    let mut refs = Vec::with_capacity(requests.len());

    for (i, request) in requests.iter().enumerate() {
        let field = format!("task_template.container.secrets[{i}]");

        let secret_id = lookup(&request.source).ok_or_else(|| {
            StoreError::validation(
                field.clone(),
                format!("secret '{}' not found", request.source),
            )
        })?;

        let file = SecretFileTarget::with_defaults(
            &request.source,
            request.target.clone(),
            request.uid.clone(),
            request.gid.clone(),
            request.mode,
        );
        file.validate()
            .map_err(|e| StoreError::validation(field.clone(), e.to_string()))?;

        if !file_names.insert(file.name.clone()) {
            return Err(StoreError::validation(
                field,
                format!("duplicate secret target '{}'", file.name),
            ));
        }

        refs.push(SecretReference {
            secret_id,
            secret_name: request.source.clone(),
            file,
        });
    }

    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerTemplate, TaskTemplate};
    use rstest::rstest;

    fn spec_with_mounts(mounts: Vec<MountRequest>) -> ServiceSpec {
        ServiceSpec {
            name: "web".into(),
            labels: Default::default(),
            task_template: TaskTemplate {
                container: ContainerTemplate {
                    image: "busybox".into(),
                    mounts,
                    ..Default::default()
                },
                restart_policy: Default::default(),
                reservations: Default::default(),
            },
            replicas: 1,
            update_policy: Default::default(),
        }
    }

    fn mount(kind: MountKind, source: Option<&str>, target: &str) -> MountRequest {
        MountRequest {
            kind,
            source: source.map(String::from),
            target: target.into(),
            read_only: false,
        }
    }

    #[rstest]
    #[case("web", true)]
    #[case("my-svc_1.a", true)]
    #[case("", false)]
    #[case("-web", false)]
    #[case("we b", false)]
    #[case("web/x", false)]
    fn test_validate_name(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_name("name", name).is_ok(), ok);
    }

    #[rstest]
    #[case(mount(MountKind::Volume, Some("foo"), "/foo"), true)]
    #[case(mount(MountKind::Volume, None, "/data"), true)]
    #[case(mount(MountKind::Volume, Some("foo"), "foo"), false)]
    #[case(mount(MountKind::Bind, Some("/srv"), "/srv"), true)]
    #[case(mount(MountKind::Bind, Some("srv"), "/srv"), false)]
    #[case(mount(MountKind::Bind, None, "/srv"), false)]
    #[case(mount(MountKind::Tmpfs, None, "/tmp"), true)]
    #[case(mount(MountKind::Tmpfs, Some("x"), "/tmp"), false)]
    #[case(mount(MountKind::Tmpfs, None, "/"), false)]
    fn test_validate_mount(#[case] m: MountRequest, #[case] ok: bool) {
        assert_eq!(validate_spec(&spec_with_mounts(vec![m])).is_ok(), ok);
    }

    #[test]
    fn test_duplicate_targets_rejected() {
        let spec = spec_with_mounts(vec![
            mount(MountKind::Volume, Some("a"), "/data"),
            mount(MountKind::Tmpfs, None, "/data/"),
        ]);
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("duplicate mount point"));
    }

    #[rstest]
    #[case(0, true)]
    #[case(MAX_REPLICAS, true)]
    #[case(MAX_REPLICAS + 1, false)]
    #[case(u64::MAX, false)]
    fn test_validate_replicas(#[case] replicas: u64, #[case] ok: bool) {
        let mut spec = spec_with_mounts(vec![]);
        spec.replicas = replicas;
        assert_eq!(validate_spec(&spec).is_ok(), ok);
    }

    #[test]
    fn test_empty_image_rejected() {
        let mut spec = spec_with_mounts(vec![]);
        spec.task_template.container.image = " ".into();
        assert!(matches!(
            validate_spec(&spec),
            Err(StoreError::Validation { .. })
        ));
    }

    #[test]
    fn test_normalize_secret_defaults() {
        let id = SecretId::new();
        let refs = normalize_secrets(&[SecretRequest::named("test_secret")], |name| {
            (name == "test_secret").then_some(id)
        })
        .unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].secret_id, id);
        assert_eq!(refs[0].secret_name, "test_secret");
        assert_eq!(refs[0].file.name, "test_secret");
        assert_eq!(refs[0].file.uid, "0");
        assert_eq!(refs[0].file.gid, "0");
        assert_eq!(refs[0].file.mode, 0o400);
    }

    #[test]
    fn test_normalize_secret_target() {
        let id = SecretId::new();
        let refs = normalize_secrets(
            &[SecretRequest::named("test_secret").with_target("testing")],
            |_| Some(id),
        )
        .unwrap();
        assert_eq!(refs[0].secret_name, "test_secret");
        assert_eq!(refs[0].file.name, "testing");
    }

    #[test]
    fn test_normalize_missing_secret() {
        let err = normalize_secrets(&[SecretRequest::named("nope")], |_| None).unwrap_err();
        assert!(err.to_string().contains("secret 'nope' not found"));
    }

    #[test]
    fn test_normalize_duplicate_file_names() {
        let requests = [
            SecretRequest::named("a").with_target("same"),
            SecretRequest::named("b").with_target("same"),
        ];
        let err = normalize_secrets(&requests, |_| Some(SecretId::new())).unwrap_err();
        assert!(err.to_string().contains("duplicate secret target"));
    }

    #[test]
    fn test_normalize_bad_file_name() {
        let requests = [SecretRequest::named("a").with_target("../etc/passwd")];
        assert!(normalize_secrets(&requests, |_| Some(SecretId::new())).is_err());
    }
}
