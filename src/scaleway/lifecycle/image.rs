//! Resolution of a suite's distro label to a Scaleway image identifier.

use crate::backend::InstanceRequest;
use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use super::super::{ScalewayBackend, ScalewayBackendError};

impl ScalewayBackend {
    /// Looks the label up among project images first, then public images.
    pub(in crate::scaleway) async fn resolve_image_id(
        &self,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayBackendError> {
        let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &request.zone)
            .project(&request.project_id)
            .name(&request.image_label)
            .arch(&request.architecture);
        if let Some(org) = &request.organisation_id {
            scoped = scoped.organization(org);
        }
        let project_images = Self::usable_images(scoped.run_async().await?, request);
        if !project_images.is_empty() {
            return Self::newest_image(project_images, request);
        }

        let public = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &request.zone)
            .public(true)
            .name(&request.image_label)
            .arch(&request.architecture)
            .run_async()
            .await?;
        Self::newest_image(Self::usable_images(public, request), request)
    }

    pub(in crate::scaleway) fn usable_images(
        images: Vec<ScalewayImage>,
        request: &InstanceRequest,
    ) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == request.architecture && image.state == "available")
            .collect()
    }

    pub(in crate::scaleway) fn newest_image(
        candidates: Vec<ScalewayImage>,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayBackendError> {
        candidates
            .into_iter()
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
            .ok_or_else(|| ScalewayBackendError::ImageNotFound {
                label: request.image_label.clone(),
                arch: request.architecture.clone(),
                zone: request.zone.clone(),
            })
    }
}
