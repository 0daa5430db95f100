use kube::core::{ApiResource, DynamicObject, TypeMeta};
use uuid::Uuid;

use crate::{Error, Result};

/// Stable object identity, the 16 bytes of `metadata.uid`.
pub type Uid = [u8; 16];

pub fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).map_err(|_| Error::InvalidUid(uid_str.to_string()))?;
    Ok(*u.as_bytes())
}

pub fn uid_of(obj: &DynamicObject) -> Result<Uid> {
    let uid_str = obj.metadata.uid.as_deref().ok_or(Error::MissingUid)?;
    to_uid(uid_str)
}

/// Normalize an object before it is cached.
#[cfg(feature = "strip-managed-fields")]
pub fn prepare(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj
}

#[cfg(not(feature = "strip-managed-fields"))]
pub fn prepare(obj: DynamicObject) -> DynamicObject {
    obj
}

/// Fill in `apiVersion`/`kind` from the resource the object was read
/// through. List and relist items arrive without them.
pub fn with_types(mut obj: DynamicObject, resource: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: resource.api_version.clone(), kind: resource.kind.clone() });
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta};

    fn obj(uid: Option<&str>) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("a".into()),
                uid: uid.map(str::to_string),
                managed_fields: Some(vec![ManagedFieldsEntry::default()]),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn uid_parses_uuid() {
        let uid = uid_of(&obj(Some("00000000-0000-0000-0000-000000000001"))).unwrap();
        assert_eq!(uid[15], 1);
        assert!(uid[..15].iter().all(|b| *b == 0));
    }

    #[test]
    fn uid_errors() {
        assert!(matches!(uid_of(&obj(None)), Err(Error::MissingUid)));
        assert!(matches!(uid_of(&obj(Some("nope"))), Err(Error::InvalidUid(_))));
    }

    fn deployments() -> ApiResource {
        ApiResource {
            group: "apps".into(),
            version: "v1".into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
        }
    }

    #[test]
    fn list_items_get_types_from_resource() {
        let list: kube::core::ObjectList<DynamicObject> = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "DeploymentList",
            "metadata": { "resourceVersion": "42" },
            "items": [
                { "metadata": { "name": "web", "namespace": "ns", "uid": "00000000-0000-0000-0000-000000000001" } },
                { "metadata": { "name": "db", "namespace": "ns", "uid": "00000000-0000-0000-0000-000000000002" } },
            ],
        }))
        .unwrap();
        assert!(list.items.iter().all(|o| o.types.is_none()));

        let items: Vec<_> = list.items.into_iter().map(|o| with_types(o, &deployments())).collect();
        for o in &items {
            let t = o.types.as_ref().unwrap();
            assert_eq!(t.api_version, "apps/v1");
            assert_eq!(t.kind, "Deployment");
        }
    }

    #[test]
    fn existing_types_are_kept() {
        let mut o = obj(Some("00000000-0000-0000-0000-000000000001"));
        o.types = Some(TypeMeta { api_version: "apps/v1beta1".into(), kind: "Deployment".into() });
        let o = with_types(o, &deployments());
        assert_eq!(o.types.unwrap().api_version, "apps/v1beta1");
    }

    #[cfg(feature = "strip-managed-fields")]
    #[test]
    fn prepare_strips_managed_fields() {
        let o = prepare(obj(Some("00000000-0000-0000-0000-000000000001")));
        assert!(o.metadata.managed_fields.is_none());
        assert_eq!(o.metadata.name.as_deref(), Some("a"));
    }
}
