use crate::model::{AccountId, OrgId, RuleId};
use money2::Money;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// When a rule is evaluated against account state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum AutoTransferFrequency {
    PerTransaction,
    Daily,
    TwiceMonthly,
}

/// Destination of a rule-driven internal transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTarget {
    pub name: String,
    pub account_id: AccountId,
    pub org_id: OrgId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionDestination {
    pub target: InternalTarget,
    pub amount: Money,
}

/// Declarative auto-transfer rules evaluated on current account state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoTransferRule {
    /// Sweep the entire balance to the target whenever it is positive.
    ZeroBalanceSweep { target: InternalTarget },
    /// Hold the balance at `target`: excess sweeps out to the managing
    /// partner, a deficit is restored by a transfer in from the partner.
    TargetBalance { managing_partner: InternalTarget, target: Money },
    /// Move fixed amounts to each destination.
    FixedDistribution { destinations: Vec<DistributionDestination> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTransferConfig {
    pub id: RuleId,
    pub frequency: AutoTransferFrequency,
    pub rule: AutoTransferRule,
}

impl AutoTransferConfig {
    /// Structural validation run before a rule is accepted onto the account.
    pub fn validate(&self, zero: Money) -> Result<(), String> {
        match &self.rule {
            AutoTransferRule::ZeroBalanceSweep { .. } => Ok(()),
            AutoTransferRule::TargetBalance { target, .. } => {
                if *target < zero {
                    Err("target balance must not be negative".to_string())
                } else {
                    Ok(())
                }
            },
            AutoTransferRule::FixedDistribution { destinations } => {
                if destinations.is_empty() {
                    return Err("distribution requires at least one destination".to_string());
                }
                if destinations.iter().any(|d| d.amount <= zero) {
                    return Err("distribution amounts must be positive".to_string());
                }
                Ok(())
            },
        }
    }
}

/// A transfer computed from one rule evaluation. `sender == owner` marks a
/// transfer out; otherwise the owner is the restore target and the managing
/// partner is asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedTransfer {
    pub rule_id: RuleId,
    pub sender: AccountId,
    pub sender_org_id: OrgId,
    pub recipient: InternalTarget,
    pub amount: Money,
}

impl ComputedTransfer {
    pub fn is_outbound_from(&self, owner: AccountId) -> bool {
        self.sender == owner
    }
}

/// Evaluates every rule of the given frequency against the current balance.
pub fn compute_auto_transfers(
    rules: &[AutoTransferConfig], frequency: AutoTransferFrequency, owner: AccountId,
    owner_org_id: OrgId, owner_name: &str, balance: Money, zero: Money,
) -> Vec<ComputedTransfer> {
    let mut computed = Vec::new();
    for config in rules.iter().filter(|c| c.frequency == frequency) {
        match &config.rule {
            AutoTransferRule::ZeroBalanceSweep { target } => {
                if zero < balance {
                    computed.push(ComputedTransfer {
                        rule_id: config.id,
                        sender: owner,
                        sender_org_id: owner_org_id,
                        recipient: target.clone(),
                        amount: balance,
                    });
                }
            },
            AutoTransferRule::TargetBalance { managing_partner, target } => {
                if *target < balance {
                    computed.push(ComputedTransfer {
                        rule_id: config.id,
                        sender: owner,
                        sender_org_id: owner_org_id,
                        recipient: managing_partner.clone(),
                        amount: balance - *target,
                    });
                } else if balance < *target {
                    computed.push(ComputedTransfer {
                        rule_id: config.id,
                        sender: managing_partner.account_id,
                        sender_org_id: managing_partner.org_id,
                        recipient: InternalTarget {
                            name: owner_name.to_string(),
                            account_id: owner,
                            org_id: owner_org_id,
                        },
                        amount: *target - balance,
                    });
                }
            },
            AutoTransferRule::FixedDistribution { destinations } => {
                for destination in destinations {
                    computed.push(ComputedTransfer {
                        rule_id: config.id,
                        sender: owner,
                        sender_org_id: owner_org_id,
                        recipient: destination.target.clone(),
                        amount: destination.amount,
                    });
                }
            },
        }
    }
    computed
}

#[cfg(test)]
mod tests {
    use super::*;
    use money2::Currency;
    use pretty_assertions::assert_eq;

    fn usd(amount: i64) -> Money {
        Money::new(amount, 2, Currency::Usd)
    }

    fn target(name: &str) -> InternalTarget {
        InternalTarget { name: name.to_string(), account_id: AccountId::new(), org_id: OrgId::new() }
    }

    #[test]
    fn test_zero_balance_sweep_moves_whole_balance() {
        let owner = AccountId::new();
        let org = OrgId::new();
        let rules = vec![AutoTransferConfig {
            id: RuleId::new(),
            frequency: AutoTransferFrequency::PerTransaction,
            rule: AutoTransferRule::ZeroBalanceSweep { target: target("ops") },
        }];

        let computed = compute_auto_transfers(
            &rules,
            AutoTransferFrequency::PerTransaction,
            owner,
            org,
            "savings",
            usd(500_00),
            usd(0),
        );
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].amount, usd(500_00));
        assert!(computed[0].is_outbound_from(owner));
    }

    #[test]
    fn test_target_balance_below_target_restores_from_partner() {
        let owner = AccountId::new();
        let org = OrgId::new();
        let partner = target("treasury");
        let rules = vec![AutoTransferConfig {
            id: RuleId::new(),
            frequency: AutoTransferFrequency::Daily,
            rule: AutoTransferRule::TargetBalance {
                managing_partner: partner.clone(),
                target: usd(1000_00),
            },
        }];

        let computed = compute_auto_transfers(
            &rules,
            AutoTransferFrequency::Daily,
            owner,
            org,
            "ops",
            usd(400_00),
            usd(0),
        );
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].sender, partner.account_id);
        assert_eq!(computed[0].recipient.account_id, owner);
        assert_eq!(computed[0].amount, usd(600_00));
        assert!(!computed[0].is_outbound_from(owner));
    }

    #[test]
    fn test_target_balance_above_target_sweeps_excess_out() {
        let owner = AccountId::new();
        let rules = vec![AutoTransferConfig {
            id: RuleId::new(),
            frequency: AutoTransferFrequency::Daily,
            rule: AutoTransferRule::TargetBalance {
                managing_partner: target("treasury"),
                target: usd(1000_00),
            },
        }];

        let computed = compute_auto_transfers(
            &rules,
            AutoTransferFrequency::Daily,
            owner,
            OrgId::new(),
            "ops",
            usd(1750_00),
            usd(0),
        );
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].amount, usd(750_00));
        assert!(computed[0].is_outbound_from(owner));
    }

    #[test]
    fn test_frequency_filter_and_distribution_fan_out() {
        let owner = AccountId::new();
        let rules = vec![
            AutoTransferConfig {
                id: RuleId::new(),
                frequency: AutoTransferFrequency::TwiceMonthly,
                rule: AutoTransferRule::FixedDistribution {
                    destinations: vec![
                        DistributionDestination { target: target("rent"), amount: usd(100_00) },
                        DistributionDestination { target: target("tax"), amount: usd(50_00) },
                    ],
                },
            },
            AutoTransferConfig {
                id: RuleId::new(),
                frequency: AutoTransferFrequency::PerTransaction,
                rule: AutoTransferRule::ZeroBalanceSweep { target: target("ops") },
            },
        ];

        let computed = compute_auto_transfers(
            &rules,
            AutoTransferFrequency::TwiceMonthly,
            owner,
            OrgId::new(),
            "payroll",
            usd(5000_00),
            usd(0),
        );
        assert_eq!(computed.len(), 2);
        assert_eq!(computed.iter().map(|t| t.amount).collect::<Vec<_>>(), vec![
            usd(100_00),
            usd(50_00)
        ]);
    }

    #[test]
    fn test_validate_rejects_empty_distribution() {
        let config = AutoTransferConfig {
            id: RuleId::new(),
            frequency: AutoTransferFrequency::Daily,
            rule: AutoTransferRule::FixedDistribution { destinations: vec![] },
        };
        assert!(config.validate(usd(0)).is_err());
    }
}
