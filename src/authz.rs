//! The authorization capability consumed from the host platform.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::UserInfo;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};

use crate::error::{Error, Result};
use crate::metadata::API_GROUP;

/// Answers "may this user administer hierarchy in this namespace". The
/// hierarchy validator uses it for the MRCA check and nothing else.
#[async_trait]
pub trait AdminChecker: Send + Sync {
    async fn is_admin(&self, user: &UserInfo, namespace: &str) -> Result<bool>;
}

/// Production implementation backed by `SubjectAccessReview`: admin means
/// allowed to update hierarchy configurations in the namespace.
pub struct SubjectAccessReviewChecker {
    client: Client,
}

impl SubjectAccessReviewChecker {
    pub fn new(client: Client) -> Self {
        SubjectAccessReviewChecker { client }
    }
}

#[async_trait]
impl AdminChecker for SubjectAccessReviewChecker {
    async fn is_admin(&self, user: &UserInfo, namespace: &str) -> Result<bool> {
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: user.username.clone(),
                groups: user.groups.clone(),
                uid: user.uid.clone(),
                resource_attributes: Some(ResourceAttributes {
                    group: Some(API_GROUP.to_string()),
                    resource: Some("hierarchyconfigurations".to_string()),
                    verb: Some("update".to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let answered = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(Error::Authorization)?;
        Ok(answered.status.map(|s| s.allowed).unwrap_or(false))
    }
}
