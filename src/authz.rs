use uuid::Uuid;

use crate::{
    auth::SessionUser,
    error::{AppError, AppResult},
    models::{Role, Unit},
};

/// Every guarded operation in the portal. Handlers name the action; the role
/// mapping lives only in [`is_allowed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GenerateBills,
    CreateBill,
    VerifyPayment,
    RecordManualPayment,
    PayManualArrears,
    UploadReceipt,
    PayOnline,
    InitiateRefund,
    ApproveRefund,
    ManageSettings,
    ManageUnits,
    ViewAllUnits,
    ViewUsers,
    OverrideVotingEligibility,
    ManageAgm,
    CastVote,
    SubmitExpense,
    ApproveExpense,
    RecordIncome,
    ViewFinanceSummary,
    ViewLedger,
    ViewAuditLog,
}

const MANAGEMENT: &[Role] = &[Role::SuperAdmin, Role::Jmb, Role::Staff, Role::Finance];
const COMMITTEE: &[Role] = &[Role::SuperAdmin, Role::Jmb];
const EVERYONE: &[Role] = &Role::ALL;

fn allowed_roles(action: Action) -> &'static [Role] {
    match action {
        Action::GenerateBills
        | Action::CreateBill
        | Action::VerifyPayment
        | Action::RecordManualPayment
        | Action::PayManualArrears
        | Action::SubmitExpense
        | Action::ViewAllUnits
        | Action::ViewLedger
        | Action::ViewUsers => MANAGEMENT,
        Action::InitiateRefund | Action::ManageUnits => &[Role::SuperAdmin, Role::Jmb, Role::Staff],
        Action::ApproveRefund => &[Role::SuperAdmin, Role::Finance],
        Action::RecordIncome => &[Role::SuperAdmin, Role::Jmb, Role::Finance],
        Action::ManageSettings
        | Action::OverrideVotingEligibility
        | Action::ManageAgm
        | Action::ApproveExpense
        | Action::ViewAuditLog => COMMITTEE,
        Action::UploadReceipt
        | Action::PayOnline
        | Action::CastVote
        | Action::ViewFinanceSummary => {
            EVERYONE
        }
    }
}

pub fn is_allowed(action: Action, role: Role) -> bool {
    allowed_roles(action).contains(&role)
}

pub fn require(user: &SessionUser, action: Action) -> AppResult<()> {
    if is_allowed(action, user.role) {
        return Ok(());
    }
    tracing::info!(user_id = %user.id, role = user.role.as_str(), ?action, "Action denied");
    Err(AppError::Forbidden(
        "Anda tidak mempunyai kebenaran untuk tindakan ini.".to_string(),
    ))
}

/// Residents may only act on units they own or rent; management acts on any.
pub fn ensure_unit_access(user: &SessionUser, unit: &Unit) -> AppResult<()> {
    if user.role.is_management() || is_unit_occupant(user.id, unit) {
        return Ok(());
    }
    Err(AppError::Forbidden(
        "Anda tidak mempunyai akses kepada unit ini.".to_string(),
    ))
}

pub fn is_unit_occupant(user_id: Uuid, unit: &Unit) -> bool {
    unit.owner_id == Some(user_id) || unit.tenant_id == Some(user_id)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::{ensure_unit_access, is_allowed, require, Action};
    use crate::{
        auth::SessionUser,
        models::{Role, Unit, UnitType},
    };

    fn user(role: Role) -> SessionUser {
        SessionUser {
            id: Uuid::new_v4(),
            name: "Test".to_string(),
            role,
        }
    }

    fn unit(owner: Option<Uuid>, tenant: Option<Uuid>) -> Unit {
        Unit {
            id: Uuid::new_v4(),
            unit_number: "J-13-1".to_string(),
            unit_type: UnitType::Bawah,
            owner_id: owner,
            tenant_id: tenant,
            manual_arrears_amount: Decimal::ZERO,
            monthly_adjustment_amount: Decimal::ZERO,
            is_active: true,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn refund_approval_is_finance_or_super_admin_only() {
        assert!(is_allowed(Action::ApproveRefund, Role::Finance));
        assert!(is_allowed(Action::ApproveRefund, Role::SuperAdmin));
        assert!(!is_allowed(Action::ApproveRefund, Role::Jmb));
        assert!(!is_allowed(Action::ApproveRefund, Role::Staff));
    }

    #[test]
    fn eligibility_override_is_committee_only() {
        for role in Role::ALL {
            let expected = matches!(role, Role::SuperAdmin | Role::Jmb);
            assert_eq!(is_allowed(Action::OverrideVotingEligibility, role), expected);
        }
    }

    #[test]
    fn residents_cannot_verify_payments() {
        assert!(require(&user(Role::Owner), Action::VerifyPayment).is_err());
        assert!(require(&user(Role::Tenant), Action::GenerateBills).is_err());
        assert!(require(&user(Role::Staff), Action::VerifyPayment).is_ok());
    }

    #[test]
    fn every_role_may_upload_receipts_and_vote() {
        for role in Role::ALL {
            assert!(is_allowed(Action::UploadReceipt, role));
            assert!(is_allowed(Action::CastVote, role));
        }
    }

    #[test]
    fn unit_access_is_limited_to_occupants_for_residents() {
        let owner = user(Role::Owner);
        let tenant = user(Role::Tenant);
        let stranger = user(Role::Owner);
        let target = unit(Some(owner.id), Some(tenant.id));

        assert!(ensure_unit_access(&owner, &target).is_ok());
        assert!(ensure_unit_access(&tenant, &target).is_ok());
        assert!(ensure_unit_access(&stranger, &target).is_err());
        assert!(ensure_unit_access(&user(Role::Staff), &target).is_ok());
    }
}
