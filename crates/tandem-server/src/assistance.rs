//! Assistance request pairing.
//!
//! One request per requester, moving through
//! `NONE -> OPEN -> PAIRED -> (OPEN | NONE)`. Requests are kept in
//! insertion order so list broadcasts stay stable; replacing a request keeps
//! its slot.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tandem_shared::protocol::AssistanceSummary;
use tandem_shared::types::{TemplateContent, UserId};

use crate::identity::IdentityRegistry;

/// An open call for help.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistanceRequest {
    pub requester_uuid: UserId,
    pub template_id: String,
    /// Snapshot taken when the request was opened.
    pub template_content: TemplateContent,
    pub created_at: DateTime<Utc>,
    pub helper_uuid: Option<UserId>,
    pub show: bool,
}

impl AssistanceRequest {
    pub fn is_paired(&self) -> bool {
        self.helper_uuid.is_some()
    }

    pub fn summary(&self) -> AssistanceSummary {
        AssistanceSummary {
            requester_uuid: self.requester_uuid,
            template_id: self.template_id.clone(),
            template_content: self.template_content.clone(),
            show: self.show,
        }
    }
}

#[derive(Debug, Default)]
pub struct AssistanceRegistry {
    requests: Vec<AssistanceRequest>,
}

impl AssistanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request for `requester`, replacing any request it already had.
    pub fn create(
        &mut self,
        identities: &mut IdentityRegistry,
        requester: UserId,
        template_id: String,
        template_content: TemplateContent,
    ) -> AssistanceRequest {
        let request = AssistanceRequest {
            requester_uuid: requester,
            template_id,
            template_content,
            created_at: Utc::now(),
            helper_uuid: None,
            show: true,
        };

        match self.position(&requester) {
            Some(index) => {
                debug!(requester = %requester, "Replacing existing assistance request");
                self.requests[index] = request.clone();
            }
            None => self.requests.push(request.clone()),
        }

        identities.set_requesting_help(&requester, true);
        info!(requester = %requester, template = %request.template_id, "Assistance requested");
        request
    }

    pub fn list(&self) -> Vec<AssistanceSummary> {
        self.requests.iter().map(AssistanceRequest::summary).collect()
    }

    pub fn get(&self, requester: &UserId) -> Option<&AssistanceRequest> {
        self.requests.iter().find(|r| r.requester_uuid == *requester)
    }

    pub fn get_by_helper(&self, helper: &UserId) -> Option<&AssistanceRequest> {
        self.requests
            .iter()
            .find(|r| r.helper_uuid.as_ref() == Some(helper))
    }

    /// Pair `helper` with the request of `requester`. An already paired
    /// request is reassigned to the new helper.
    pub fn set_helper(&mut self, requester: &UserId, helper: UserId) -> bool {
        let Some(request) = self.get_mut(requester) else {
            return false;
        };

        if let Some(previous) = request.helper_uuid.filter(|h| *h != helper) {
            warn!(
                requester = %requester,
                previous = %previous,
                helper = %helper,
                "Reassigning helper of an already paired request"
            );
        }
        request.helper_uuid = Some(helper);
        true
    }

    /// Hide the request that `helper` is paired with.
    pub fn hide(&mut self, helper: &UserId) -> bool {
        self.set_visibility(helper, false)
    }

    /// Re-advertise the request that `helper` is paired with.
    pub fn show(&mut self, helper: &UserId) -> bool {
        self.set_visibility(helper, true)
    }

    /// Unpair `helper`, returning its request to the open state.
    pub fn release_helper(&mut self, helper: &UserId) -> bool {
        match self
            .requests
            .iter_mut()
            .find(|r| r.helper_uuid.as_ref() == Some(helper))
        {
            Some(request) => {
                request.helper_uuid = None;
                true
            }
            None => false,
        }
    }

    /// Delete the request of `requester`. Returns the removed request.
    pub fn end_assistance(
        &mut self,
        identities: &mut IdentityRegistry,
        requester: &UserId,
    ) -> Option<AssistanceRequest> {
        let index = self.position(requester)?;
        let request = self.requests.remove(index);
        identities.set_requesting_help(requester, false);
        info!(
            requester = %requester,
            open_secs = (Utc::now() - request.created_at).num_seconds(),
            paired = request.is_paired(),
            "Assistance ended"
        );
        Some(request)
    }

    pub fn is_requesting(&self, requester: &UserId) -> bool {
        self.position(requester).is_some()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    fn position(&self, requester: &UserId) -> Option<usize> {
        self.requests
            .iter()
            .position(|r| r.requester_uuid == *requester)
    }

    fn get_mut(&mut self, requester: &UserId) -> Option<&mut AssistanceRequest> {
        self.requests
            .iter_mut()
            .find(|r| r.requester_uuid == *requester)
    }

    fn set_visibility(&mut self, helper: &UserId, show: bool) -> bool {
        match self
            .requests
            .iter_mut()
            .find(|r| r.helper_uuid.as_ref() == Some(helper))
        {
            Some(request) => {
                request.show = show;
                true
            }
            None => false,
        }
    }
}
