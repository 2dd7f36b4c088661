//! # Admission Webhooks
//!
//! AdmissionReview handlers for KeystoneAPI.
//!
//! - `/mutate-keystoneapi`: applies the [`Defaulter`] and answers with a JSON patch
//! - `/validate-keystoneapi`: runs the create/update checks
//!
//! Requests are decoded as `DynamicObject` so that a spec which fails to
//! deserialize is denied with the serde message instead of a 400.

use crate::admission::{self, Defaulter};
use crate::crd::KeystoneAPI;
use crate::server::ServerState;
use axum::extract::State;
use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn typed(obj: &DynamicObject) -> Result<KeystoneAPI, serde_json::Error> {
    serde_json::to_value(obj).and_then(serde_json::from_value)
}

pub async fn mutate_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(mutate(&state.defaulter, &req).into_review())
}

/// Default one KeystoneAPI admission request
pub fn mutate(defaulter: &Defaulter, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(obj) = req.object.as_ref() else {
        debug!(uid = %req.uid, "No object in request, allowing unchanged");
        return response;
    };

    let mut api = match typed(obj) {
        Ok(api) => api,
        Err(e) => return response.deny(format!("invalid KeystoneAPI: {}", e)),
    };
    defaulter.default_spec(&mut api.spec);

    // Diff against the submitted body so every op applies to what was sent
    let before = obj.data.clone();
    let mut after = before.clone();
    match serde_json::to_value(&api.spec) {
        Ok(spec) => after["spec"] = spec,
        Err(e) => return response.deny(format!("invalid KeystoneAPI: {}", e)),
    }
    let patch = json_patch::diff(&before, &after);
    if patch.0.is_empty() {
        return response;
    }

    info!(
        uid = %req.uid,
        name = %req.name,
        patch_ops = patch.0.len(),
        "Defaulting KeystoneAPI"
    );
    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Failed to serialize patch");
            AdmissionResponse::from(req).deny(format!("patch serialization error: {e}"))
        }
    }
}

pub async fn validate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(validate(&req).into_review())
}

/// Validate one KeystoneAPI admission request
#[must_use]
pub fn validate(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(obj) = req.object.as_ref() else {
        return response;
    };
    let new = match typed(obj) {
        Ok(api) => api,
        Err(e) => return response.deny(format!("invalid KeystoneAPI: {}", e)),
    };

    let result = match (&req.operation, req.old_object.as_ref()) {
        (Operation::Update, Some(old)) => match typed(old) {
            Ok(old) => admission::validate_update(&old, &new),
            Err(e) => return response.deny(format!("invalid stored KeystoneAPI: {}", e)),
        },
        _ => admission::validate_create(&new),
    };

    match result {
        Ok(()) => response,
        Err(errors) => {
            let message = admission::summarize(&errors);
            warn!(uid = %req.uid, name = %req.name, "Rejecting KeystoneAPI: {}", message);
            response.deny(message)
        }
    }
}
