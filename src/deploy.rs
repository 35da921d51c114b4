// ============================================
// FFU Builder - deploy.rs
// ============================================
// Applies a Windows image (WIM/ESD) onto the OS partition.
//
// HOW IT WORKS:
// 1. Pre-flight: services checked, compact refused on server images
// 2. Each attempt:
//    a. Validate the source (file readable, parent ISO still mounted
//       at the same root)
//    b. DISM /Apply-Image
//    c. On failure, classify it:
//       - Disconnected -> remount the ISO, find the image again, retry
//       - anything else -> wait a fixed backoff, retry
// 3. Out of attempts -> fatal, carrying the last concrete DISM failure
//
// An apply takes minutes. Windows likes to auto-dismount ISOs during that
// time, which is why the disconnect path exists at all.
// ============================================

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::Timings;
use crate::dism::{FailureClass, ImagingError, ImagingTool};
use crate::media::{self, ImageSource, MediaError, MediaManager};
use crate::services::ServiceReadinessChecker;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("compact apply is not supported on server images ({image} is installation type {installation_type})")]
    ServerCompact {
        image: PathBuf,
        installation_type: String,
    },

    #[error("could not read image metadata: {0}")]
    ImageInfo(#[source] ImagingError),

    #[error("image source is not usable: {0}")]
    InvalidSource(#[source] MediaError),

    #[error("remounting source media failed: {0}")]
    Remount(#[source] MediaError),

    #[error("image apply failed after {attempts} attempt(s); last failure ({class}): {last}")]
    RetriesExhausted {
        attempts: u32,
        class: FailureClass,
        #[source]
        last: ImagingError,
    },
}

/// Record of a deployment: how many attempts it took, what the last
/// failure looked like, and which path the image was finally applied from.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentAttempt {
    pub attempt: u32,
    pub last_failure: Option<FailureClass>,
    /// Rewritten when a remount moves the image to a new root
    pub image_path: PathBuf,
}

pub struct ImageDeployer<'a> {
    imaging: &'a dyn ImagingTool,
    media: &'a dyn MediaManager,
    readiness: &'a ServiceReadinessChecker<'a>,
    timings: &'a Timings,
}

impl<'a> ImageDeployer<'a> {
    pub fn new(
        imaging: &'a dyn ImagingTool,
        media: &'a dyn MediaManager,
        readiness: &'a ServiceReadinessChecker<'a>,
        timings: &'a Timings,
    ) -> Self {
        ImageDeployer { imaging, media, readiness, timings }
    }

    /// Apply `source` onto `target` (the OS partition root).
    ///
    /// # Returns
    /// The final attempt record on success. The source passed in is not
    /// modified; the remounted path is in `DeploymentAttempt::image_path`.
    pub fn apply_image(
        &self,
        source: &ImageSource,
        target: &Path,
        compact: bool,
    ) -> Result<DeploymentAttempt, DeployError> {
        self.readiness.ensure_ready();

        if compact {
            let info = self
                .imaging
                .image_info(&source.path, source.index)
                .map_err(DeployError::ImageInfo)?;
            if info.is_server() {
                return Err(DeployError::ServerCompact {
                    image: source.path.clone(),
                    installation_type: info.installation_type.unwrap_or_default(),
                });
            }
        }

        let max_attempts = self.timings.apply_attempts.max(1);
        let mut current = source.clone();
        let mut record = DeploymentAttempt {
            attempt: 0,
            last_failure: None,
            image_path: current.path.clone(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            record.attempt = attempt;
            current = self.validated(current)?;
            record.image_path = current.path.clone();

            log::info!(
                "Apply attempt {}/{}: {} (index {}) -> {}",
                attempt,
                max_attempts,
                current.path.display(),
                current.index,
                target.display()
            );

            let error = match self.imaging.apply_image(&current.path, current.index, target, compact) {
                Ok(()) => {
                    log::info!("Image applied on attempt {}", attempt);
                    return Ok(record);
                }
                Err(e) => e,
            };

            let class = error.classify();
            record.last_failure = Some(class);
            log::warn!("Apply attempt {} failed ({}): {}", attempt, class, error);

            if attempt >= max_attempts {
                return Err(DeployError::RetriesExhausted {
                    attempts: max_attempts,
                    class,
                    last: error,
                });
            }

            if class == FailureClass::Disconnected && current.media.is_some() {
                current = media::remount_source(&current, self.media, self.timings.remount_settle)
                    .map_err(DeployError::Remount)?;
                record.image_path = current.path.clone();
            } else {
                log::info!("Waiting {}s before retrying", self.timings.apply_backoff.as_secs());
                std::thread::sleep(self.timings.apply_backoff);
            }
        }
    }

    /// Validate, remounting once if the parent media went away.
    fn validated(&self, source: ImageSource) -> Result<ImageSource, DeployError> {
        match source.validate(self.media) {
            Ok(()) => Ok(source),
            Err(e) if e.media_gone() => {
                log::warn!("{}", e);
                let remounted = media::remount_source(&source, self.media, self.timings.remount_settle)
                    .map_err(DeployError::Remount)?;
                remounted.validate(self.media).map_err(DeployError::InvalidSource)?;
                Ok(remounted)
            }
            Err(e) => Err(DeployError::InvalidSource(e)),
        }
    }
}
