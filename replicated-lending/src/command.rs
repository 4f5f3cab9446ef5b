use crate::model::Loan;

/// Logical effect of a committed primary write, replayed on the secondary.
///
/// Grants carry the primary's loan so the secondary keeps the same loan id;
/// later returns and renewals then hit the same record on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatedWrite {
    Grant { loan: Loan },
    Return { loan_id: String },
    Renewal { loan_id: String, new_end_date: String },
}

impl ReplicatedWrite {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicatedWrite::Grant { .. } => "grant",
            ReplicatedWrite::Return { .. } => "return",
            ReplicatedWrite::Renewal { .. } => "renewal",
        }
    }

    pub fn loan_id(&self) -> &str {
        match self {
            ReplicatedWrite::Grant { loan } => &loan.id,
            ReplicatedWrite::Return { loan_id } | ReplicatedWrite::Renewal { loan_id, .. } => {
                loan_id
            }
        }
    }
}
