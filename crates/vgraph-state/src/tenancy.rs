//! Tenancy: the owning-account scope stamped on every versioned row.
//!
//! The hierarchy is billing account → organization → workspace. A row owned at
//! a higher level is visible to every scope beneath it. Universal rows are
//! shared by every tenant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

macro_rules! tenancy_pk {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

tenancy_pk!(BillingAccountPk);
tenancy_pk!(OrganizationPk);
tenancy_pk!(WorkspacePk);

/// Owning-account scope of a row, or the universal/shared scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenancy {
    pub universal: bool,
    pub billing_account_pk: Option<BillingAccountPk>,
    pub organization_pk: Option<OrganizationPk>,
    pub workspace_pk: Option<WorkspacePk>,
}

impl Tenancy {
    /// The shared scope visible to every tenant.
    pub fn new_universal() -> Self {
        Self {
            universal: true,
            ..Self::default()
        }
    }

    pub fn new_billing_account(billing_account_pk: BillingAccountPk) -> Self {
        Self {
            billing_account_pk: Some(billing_account_pk),
            ..Self::default()
        }
    }

    pub fn new_organization(
        billing_account_pk: BillingAccountPk,
        organization_pk: OrganizationPk,
    ) -> Self {
        Self {
            billing_account_pk: Some(billing_account_pk),
            organization_pk: Some(organization_pk),
            ..Self::default()
        }
    }

    pub fn new_workspace(
        billing_account_pk: BillingAccountPk,
        organization_pk: OrganizationPk,
        workspace_pk: WorkspacePk,
    ) -> Self {
        Self {
            universal: false,
            billing_account_pk: Some(billing_account_pk),
            organization_pk: Some(organization_pk),
            workspace_pk: Some(workspace_pk),
        }
    }

    /// An empty tenancy names no scope at all and may not be used for reads or
    /// writes.
    pub fn is_empty(&self) -> bool {
        !self.universal && self.billing_account_pk.is_none()
    }

    /// Reject tenancies that cannot scope a query.
    ///
    /// A workspace without an organization (or an organization without an
    /// account) is malformed: the hierarchy must be filled top-down.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.is_empty() {
            return Err(StorageError::ScopeViolation {
                reason: "tenancy names neither the universal scope nor a billing account".into(),
            });
        }
        if self.workspace_pk.is_some() && self.organization_pk.is_none() {
            return Err(StorageError::ScopeViolation {
                reason: "workspace tenancy is missing its organization".into(),
            });
        }
        if self.organization_pk.is_some() && self.billing_account_pk.is_none() {
            return Err(StorageError::ScopeViolation {
                reason: "organization tenancy is missing its billing account".into(),
            });
        }
        Ok(())
    }

    /// Whether a row stamped with `row` is readable from this (reader) tenancy.
    ///
    /// Universal rows are always readable. Otherwise every level the row names
    /// must match the reader's level, so an account-level row is readable from
    /// any organization or workspace of that account.
    pub fn can_read(&self, row: &Tenancy) -> bool {
        if row.universal {
            return true;
        }
        let Some(row_account) = row.billing_account_pk else {
            return false;
        };
        if self.billing_account_pk != Some(row_account) {
            return false;
        }
        if let Some(row_org) = row.organization_pk {
            if self.organization_pk != Some(row_org) {
                return false;
            }
        }
        if let Some(row_ws) = row.workspace_pk {
            if self.workspace_pk != Some(row_ws) {
                return false;
            }
        }
        true
    }
}
