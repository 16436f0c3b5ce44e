//! Built-in processing steps and the file names they share.
//!
//! Every product is named from the item's file prefix so the outputs one
//! step declares are exactly the prerequisites the next step checks.

mod connectome;
mod copy_data;
mod degibbs;
mod denoise;
mod eddy;
mod mdt;
mod mrtrix_prep;
mod roi_registration;
mod sift2;
mod topup;
mod tractography;

pub use connectome::Connectome;
pub use copy_data::CopyData;
pub use degibbs::Degibbs;
pub use denoise::Denoise;
pub use eddy::Eddy;
pub use mdt::Mdt;
pub use mrtrix_prep::MrtrixPrep;
pub use roi_registration::RoiRegistration;
pub use sift2::Sift2;
pub use topup::Topup;
pub use tractography::Tractography;

pub(crate) use copy_data::{plan_dwi_copies, DwiCopy};

use std::path::PathBuf;

use subtract_types::WorkItem;

use crate::step::StepEnv;

/// Hemisphere suffixes of the seeded track sets.
pub(crate) const HEMISPHERES: [&str; 2] = ["L", "R"];

pub(crate) fn hemisphere_name(hemi: &str) -> &'static str {
    if hemi == "L" {
        "left"
    } else {
        "right"
    }
}

pub(crate) fn tracks(env: &StepEnv, item: &WorkItem, hemi: &str) -> PathBuf {
    env.mrtrix_dir(item).join(format!(
        "tracks_{}_BNST_{hemi}.tck",
        env.config.processing.track_label()
    ))
}

pub(crate) fn parcellation(env: &StepEnv, item: &WorkItem, hemi: &str) -> PathBuf {
    env.roi_dir(item)
        .join(format!("{}_bnst_network_parcellation.mif", hemisphere_name(hemi)))
}

/// Directory MDT writes a model's maps to.
pub(crate) fn model_dir(env: &StepEnv, item: &WorkItem, model: &str) -> PathBuf {
    env.mdt_dir(item)
        .join("output")
        .join(format!("{}_brain_mask", item.file_prefix()))
        .join(model)
}

/// Maps downstream steps read from a fitted model. Models nothing consumes
/// declare none.
pub(crate) fn model_maps(env: &StepEnv, item: &WorkItem, model: &str) -> Vec<PathBuf> {
    let maps: &[&str] = match model {
        "NODDIDA" => &["NDI", "ODI"],
        "BallStick_r1" => &["w_stick0.w", "w_ball.w"],
        _ => &[],
    };
    let dir = model_dir(env, item, model);
    maps.iter().map(|m| dir.join(format!("{m}.nii.gz"))).collect()
}
