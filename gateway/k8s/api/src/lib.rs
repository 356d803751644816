#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
pub mod review;
pub mod status;
pub mod table;

pub use self::{
    review::Reviewer,
    status::{Reason, StatusError},
    table::Table,
};
pub use k8s_openapi::{
    api::{
        authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus, UserInfo},
        authorization::v1::{
            NonResourceAttributes, ResourceAttributes, SubjectAccessReview,
            SubjectAccessReviewSpec, SubjectAccessReviewStatus,
        },
        core::v1::{
            Container, Node, NodeAddress, NodeSpec, NodeStatus, Pod, PodSpec, PodStatus,
            Service, ServicePort, ServiceSpec, ServiceStatus, Taint,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{ListMeta, Status},
    },
    kube_aggregator::pkg::apis::apiregistration::v1::{
        APIService, APIServiceSpec, ServiceReference,
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectList, ObjectMeta, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
