//! Transaction validation
//!
//! [`validate_transaction`] is a pure check against a read-only chain view.
//! It returns a [`TxVerdict`] describing what applying the transaction would
//! do; committing that is up to the caller.

use std::collections::HashSet;

use crate::consensus::Currency;
use crate::crypto::{Hash, KeyImage, PublicKey};
use crate::error::{CoreError, CoreResult};
use crate::validation::{Transaction, TxInput, TX_VERSION_1, TX_VERSION_2};

/// An output recorded on the main chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub global_index: u32,
    pub tx_hash: Hash,
    pub index_in_tx: u32,
    pub amount: u64,
    pub key: PublicKey,
    pub deposit_term: Option<u32>,
    /// Unlock time of the creating transaction
    pub unlock_time: u64,
    /// Height of the block that created the output
    pub height: u64,
    pub key_image: KeyImage,
}

/// Read access to main-chain outputs and the spent set
pub trait ChainView {
    fn output(&self, tx_hash: &Hash, index: u32) -> Option<&OutputRecord>;
    fn output_at(&self, global_index: u32) -> Option<&OutputRecord>;
    fn is_spent(&self, key_image: &KeyImage) -> bool;
    fn has_transaction(&self, tx_hash: &Hash) -> bool;
}

/// Key images claimed outside the chain view, such as earlier
/// transactions of the block being validated
pub trait SpentImages {
    fn contains_image(&self, key_image: &KeyImage) -> bool;
}

impl SpentImages for HashSet<KeyImage> {
    fn contains_image(&self, key_image: &KeyImage) -> bool {
        self.contains(key_image)
    }
}

/// Empty conflict set
pub struct NoConflicts;

impl SpentImages for NoConflicts {
    fn contains_image(&self, _key_image: &KeyImage) -> bool {
        false
    }
}

/// How strictly ring decoys are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Pool admission: decoys may be spent, they are rechecked at assembly
    Pool,
    /// Block inclusion: every ring member must still be unspent
    Strict,
}

/// Position the transaction would be spent at
#[derive(Debug, Clone, Copy)]
pub struct SpendContext {
    /// Height of the block the transaction lands in
    pub height: u64,
    /// Block timestamp, or local time for pool admission
    pub time: u64,
    pub mode: ValidationMode,
}

/// Effects of a valid transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxVerdict {
    pub hash: Hash,
    pub fee: u64,
    pub size: u64,
    pub key_images: Vec<KeyImage>,
    pub input_amount: u64,
    pub output_amount: u64,
    /// Interest released by matured deposits spent here
    pub interest: u64,
    pub deposits_created: u64,
    /// Principal of deposits spent here
    pub deposits_spent: u64,
    pub fusion: bool,
}

/// Context-free checks: versions, shapes, amounts and size
///
/// Returns the encoded size. Safe to run before taking any lock.
pub fn check_structure(currency: &Currency, tx: &Transaction) -> CoreResult<u64> {
    if tx.version != TX_VERSION_1 && tx.version != TX_VERSION_2 {
        return Err(CoreError::MalformedStructure(format!(
            "unsupported transaction version {}",
            tx.version
        )));
    }
    if tx.inputs.is_empty() {
        return Err(CoreError::MalformedStructure("no inputs".into()));
    }
    if tx.outputs.is_empty() {
        return Err(CoreError::MalformedStructure("no outputs".into()));
    }
    if tx.signatures.len() != tx.inputs.len() {
        return Err(CoreError::MalformedStructure(format!(
            "{} signatures for {} inputs",
            tx.signatures.len(),
            tx.inputs.len()
        )));
    }

    for input in &tx.inputs {
        match (tx.version, input) {
            (TX_VERSION_1, TxInput::ToOutput { .. }) => {}
            (TX_VERSION_2, TxInput::ToKey { amount, ring, .. }) => {
                if *amount == 0 {
                    return Err(CoreError::MalformedStructure("zero input amount".into()));
                }
                if ring.is_empty() {
                    return Err(CoreError::MalformedStructure("empty ring".into()));
                }
                if ring.windows(2).any(|pair| pair[0] >= pair[1]) {
                    return Err(CoreError::MalformedStructure(
                        "ring indexes not strictly ascending".into(),
                    ));
                }
            }
            _ => {
                return Err(CoreError::MalformedStructure(format!(
                    "input kind not allowed in version {}",
                    tx.version
                )))
            }
        }
    }

    for output in &tx.outputs {
        if output.amount == 0 {
            return Err(CoreError::MalformedStructure("zero output amount".into()));
        }
        if let Some(term) = output.deposit_term {
            if !currency.is_deposit_term_valid(term) {
                return Err(CoreError::MalformedStructure(format!("invalid deposit term {}", term)));
            }
            if output.amount < currency.deposit_min_amount {
                return Err(CoreError::MalformedStructure(format!(
                    "deposit {} below minimum {}",
                    output.amount, currency.deposit_min_amount
                )));
            }
        }
    }
    if tx.output_amount().is_none() {
        return Err(CoreError::Overflow("output amounts overflow".into()));
    }

    let size = tx.size();
    let limit = if currency.is_fusion_transaction(tx, size) {
        currency.fusion_tx_max_size
    } else {
        currency.max_tx_size
    };
    if size > limit {
        return Err(CoreError::SizeExceeded(format!(
            "transaction size {} exceeds {}",
            size, limit
        )));
    }

    Ok(size)
}

/// Outputs an input draws on
struct ResolvedInput<'a> {
    value: u64,
    interest: u64,
    deposit_principal: u64,
    key_image: KeyImage,
    sources: Vec<&'a OutputRecord>,
}

fn resolve_input<'a>(
    currency: &Currency,
    input: &TxInput,
    signature_ok: impl Fn(&PublicKey) -> bool,
    view: &'a dyn ChainView,
    ctx: &SpendContext,
) -> CoreResult<ResolvedInput<'a>> {
    match input {
        TxInput::ToOutput {
            tx_hash,
            output_index,
        } => {
            let source = view.output(tx_hash, *output_index).ok_or_else(|| {
                CoreError::MalformedStructure(format!("unknown output {}:{}", tx_hash, output_index))
            })?;
            if !signature_ok(&source.key) {
                return Err(CoreError::InvalidSignature(format!(
                    "input spending {}:{}",
                    tx_hash, output_index
                )));
            }
            let (interest, deposit_principal) = match source.deposit_term {
                Some(term) => (currency.calculate_interest(source.amount, term), source.amount),
                None => (0, 0),
            };
            let value = source
                .amount
                .checked_add(interest)
                .ok_or_else(|| CoreError::Overflow("deposit interest overflows".into()))?;
            Ok(ResolvedInput {
                value,
                interest,
                deposit_principal,
                key_image: source.key_image,
                sources: vec![source],
            })
        }
        TxInput::ToKey {
            amount,
            ring,
            key_image,
        } => {
            let mut members = Vec::with_capacity(ring.len());
            for index in ring {
                let member = view.output_at(*index).ok_or_else(|| {
                    CoreError::MalformedStructure(format!("unknown ring member {}", index))
                })?;
                if member.amount != *amount {
                    return Err(CoreError::MalformedStructure(format!(
                        "ring member {} has amount {}, input declares {}",
                        index, member.amount, amount
                    )));
                }
                if member.deposit_term.is_some() {
                    return Err(CoreError::MalformedStructure(format!(
                        "ring member {} is a deposit",
                        index
                    )));
                }
                members.push(member);
            }

            let real = members
                .iter()
                .find(|member| member.key_image == *key_image)
                .ok_or_else(|| {
                    CoreError::InvalidSignature("key image matches no ring member".into())
                })?;
            if !signature_ok(&real.key) {
                return Err(CoreError::InvalidSignature(format!(
                    "ring signature for key image {}",
                    key_image
                )));
            }

            if ctx.mode == ValidationMode::Strict {
                if let Some(spent) = members
                    .iter()
                    .find(|m| m.key_image != *key_image && view.is_spent(&m.key_image))
                {
                    return Err(CoreError::DoubleSpend(format!(
                        "ring decoy {} already spent",
                        spent.global_index
                    )));
                }
            }

            Ok(ResolvedInput {
                value: *amount,
                interest: 0,
                deposit_principal: 0,
                key_image: *key_image,
                sources: members,
            })
        }
    }
}

/// Validate `tx` for inclusion at `ctx.height`
///
/// Checks run in a fixed order and stop at the first failure: structure,
/// signatures, duplicate inputs, spent inputs, fee, then lock times.
/// `conflicts` holds key images claimed outside `view`.
pub fn validate_transaction(
    currency: &Currency,
    tx: &Transaction,
    view: &dyn ChainView,
    ctx: &SpendContext,
    conflicts: &dyn SpentImages,
) -> CoreResult<TxVerdict> {
    let size = check_structure(currency, tx)?;
    let prefix_hash = tx.prefix_hash();

    let mut resolved = Vec::with_capacity(tx.inputs.len());
    let mut input_amount: u64 = 0;
    for (input, signature) in tx.inputs.iter().zip(&tx.signatures) {
        let input = resolve_input(
            currency,
            input,
            |key| key.verify(&prefix_hash, signature),
            view,
            ctx,
        )?;
        input_amount = input_amount
            .checked_add(input.value)
            .ok_or_else(|| CoreError::Overflow("input amounts overflow".into()))?;
        resolved.push(input);
    }

    let mut seen = HashSet::with_capacity(resolved.len());
    for input in &resolved {
        if !seen.insert(input.key_image) {
            return Err(CoreError::DoubleSpend(format!(
                "key image {} used twice in transaction",
                input.key_image
            )));
        }
    }

    for input in &resolved {
        if view.is_spent(&input.key_image) {
            return Err(CoreError::DoubleSpend(format!(
                "key image {} already spent on chain",
                input.key_image
            )));
        }
        if conflicts.contains_image(&input.key_image) {
            return Err(CoreError::DoubleSpend(format!(
                "key image {} already claimed",
                input.key_image
            )));
        }
    }

    // check_structure rejected overflowing outputs
    let output_amount = tx.output_amount().unwrap_or(u64::MAX);
    if input_amount < output_amount {
        return Err(CoreError::MalformedStructure(format!(
            "outputs {} exceed inputs {}",
            output_amount, input_amount
        )));
    }
    let fee = input_amount - output_amount;
    let fusion = currency.is_fusion_transaction(tx, size);
    let minimum_fee = currency.minimum_fee_for(tx);
    if !fusion && fee < minimum_fee {
        return Err(CoreError::BelowMinFee(format!("fee {} < {}", fee, minimum_fee)));
    }

    for input in &resolved {
        for source in &input.sources {
            if !currency.is_unlocked(source.unlock_time, ctx.height, ctx.time) {
                return Err(CoreError::LockTimeNotReached(format!(
                    "output {} locked until {}",
                    source.global_index, source.unlock_time
                )));
            }
            if let Some(term) = source.deposit_term {
                if !currency.is_deposit_matured(source.height, term, ctx.height) {
                    return Err(CoreError::LockTimeNotReached(format!(
                        "deposit {} matures at height {}",
                        source.global_index,
                        source.height + term as u64
                    )));
                }
            }
        }
    }

    Ok(TxVerdict {
        hash: tx.hash(),
        fee,
        size,
        key_images: resolved.iter().map(|input| input.key_image).collect(),
        input_amount,
        output_amount,
        interest: resolved.iter().map(|input| input.interest).sum(),
        deposits_created: tx.deposit_amount(),
        deposits_spent: resolved.iter().map(|input| input.deposit_principal).sum(),
        fusion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::CurrencyBuilder;
    use crate::crypto::{derive_key_image, hash_bytes, PrivateKey};
    use crate::error::ErrorKind;
    use crate::validation::TxOutput;
    use crate::wallet::TransactionBuilder;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockView {
        outputs: Vec<OutputRecord>,
        by_outpoint: HashMap<(Hash, u32), usize>,
        spent: HashSet<KeyImage>,
    }

    impl MockView {
        fn add(&mut self, amount: u64, key: PublicKey, unlock_time: u64, deposit_term: Option<u32>) -> (Hash, u32) {
            let index = self.outputs.len() as u32;
            let tx_hash = hash_bytes(&index.to_le_bytes());
            self.outputs.push(OutputRecord {
                global_index: index,
                tx_hash,
                index_in_tx: 0,
                amount,
                key,
                deposit_term,
                unlock_time,
                height: 1,
                key_image: derive_key_image(&tx_hash, 0),
            });
            self.by_outpoint.insert((tx_hash, 0), index as usize);
            (tx_hash, index)
        }
    }

    impl ChainView for MockView {
        fn output(&self, tx_hash: &Hash, index: u32) -> Option<&OutputRecord> {
            self.by_outpoint.get(&(*tx_hash, index)).map(|i| &self.outputs[*i])
        }
        fn output_at(&self, global_index: u32) -> Option<&OutputRecord> {
            self.outputs.get(global_index as usize)
        }
        fn is_spent(&self, key_image: &KeyImage) -> bool {
            self.spent.contains(key_image)
        }
        fn has_transaction(&self, _tx_hash: &Hash) -> bool {
            false
        }
    }

    fn currency() -> Currency {
        CurrencyBuilder::new().deposit_terms(5, 100).build().unwrap()
    }

    const POOL: SpendContext = SpendContext {
        height: 10,
        time: 1_700_000_000,
        mode: ValidationMode::Pool,
    };

    fn spend(view_tx: (Hash, u32), owner: &PrivateKey, outputs: &[u64]) -> Transaction {
        let mut builder = TransactionBuilder::v1().spend_output(view_tx.0, 0, owner.clone());
        for amount in outputs {
            builder = builder.pay(PrivateKey::generate().public_key(), *amount);
        }
        builder.build()
    }

    #[test]
    fn test_valid_spend_reports_fee() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let source = view.add(10_000, owner.public_key(), 0, None);

        let tx = spend(source, &owner, &[9_000]);
        let verdict = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap();
        assert_eq!(verdict.fee, 1_000);
        assert_eq!(verdict.key_images, vec![derive_key_image(&source.0, 0)]);
        assert!(!verdict.fusion);
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let owner = PrivateKey::generate();
        let thief = PrivateKey::generate();
        let mut view = MockView::default();
        let source = view.add(10_000, owner.public_key(), 0, None);

        let tx = spend(source, &thief, &[9_000]);
        let err = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn test_spent_and_conflicting_inputs_rejected() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let source = view.add(10_000, owner.public_key(), 0, None);
        let tx = spend(source, &owner, &[9_000]);
        let image = derive_key_image(&source.0, 0);

        let mut claimed = HashSet::new();
        claimed.insert(image);
        let err = validate_transaction(&currency(), &tx, &view, &POOL, &claimed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DoubleSpend);

        view.spent.insert(image);
        let err = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DoubleSpend);
    }

    #[test]
    fn test_duplicate_input_rejected() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let source = view.add(10_000, owner.public_key(), 0, None);
        let tx = TransactionBuilder::v1()
            .spend_output(source.0, 0, owner.clone())
            .spend_output(source.0, 0, owner.clone())
            .pay(owner.public_key(), 100)
            .build();

        let err = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DoubleSpend);
    }

    #[test]
    fn test_fee_floor() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let source = view.add(10_000, owner.public_key(), 0, None);
        let currency = currency();

        let low = spend(source, &owner, &[10_000 - 99]);
        let err = validate_transaction(&currency, &low, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BelowMinFee);

        let exact = spend(source, &owner, &[10_000 - 100]);
        assert!(validate_transaction(&currency, &exact, &view, &POOL, &NoConflicts).is_ok());
    }

    #[test]
    fn test_outputs_exceeding_inputs_rejected() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let source = view.add(10_000, owner.public_key(), 0, None);

        let tx = spend(source, &owner, &[10_001]);
        let err = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedStructure);
    }

    #[test]
    fn test_locked_output_rejected() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let source = view.add(10_000, owner.public_key(), 11, None);

        let tx = spend(source, &owner, &[9_000]);
        let err = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeNotReached);
    }

    #[test]
    fn test_fusion_exempt_from_fee() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let mut builder = TransactionBuilder::v1();
        for _ in 0..12 {
            let source = view.add(1_000, owner.public_key(), 0, None);
            builder = builder.spend_output(source.0, 0, owner.clone());
        }
        let tx = builder.pay(owner.public_key(), 12_000).build();

        let verdict = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap();
        assert!(verdict.fusion);
        assert_eq!(verdict.fee, 0);
    }

    #[test]
    fn test_deposit_matures_with_interest() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let currency = currency();
        let principal = 100 * crate::constants::COIN;
        let source = view.add(principal, owner.public_key(), 0, Some(50));
        let interest = currency.calculate_interest(principal, 50);

        let tx = spend(source, &owner, &[principal + interest - 100]);
        let early = SpendContext { height: 50, ..POOL };
        let err = validate_transaction(&currency, &tx, &view, &early, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeNotReached);

        let matured = SpendContext { height: 51, ..POOL };
        let verdict = validate_transaction(&currency, &tx, &view, &matured, &NoConflicts).unwrap();
        assert_eq!(verdict.interest, interest);
        assert_eq!(verdict.deposits_spent, principal);
    }

    #[test]
    fn test_deposit_creation_needs_banking_fee() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let amount = 10 * crate::constants::COIN;
        let source = view.add(amount, owner.public_key(), 0, None);

        let tx = TransactionBuilder::v1()
            .spend_output(source.0, 0, owner.clone())
            .deposit(owner.public_key(), amount - 500, 20)
            .build();
        let err = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BelowMinFee);
    }

    #[test]
    fn test_ring_spend_and_strict_decoys() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let (_, decoy) = view.add(5_000, PrivateKey::generate().public_key(), 0, None);
        let (real_tx, real) = view.add(5_000, owner.public_key(), 0, None);

        let tx = TransactionBuilder::v2()
            .spend_ring(5_000, vec![decoy, real], derive_key_image(&real_tx, 0), owner.clone())
            .pay(owner.public_key(), 4_900)
            .build();
        assert!(validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).is_ok());

        view.spent.insert(view.outputs[decoy as usize].key_image);
        assert!(validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).is_ok());
        let strict = SpendContext {
            mode: ValidationMode::Strict,
            ..POOL
        };
        let err = validate_transaction(&currency(), &tx, &view, &strict, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DoubleSpend);
    }

    #[test]
    fn test_ring_with_foreign_key_image_rejected() {
        let owner = PrivateKey::generate();
        let mut view = MockView::default();
        let (_, member) = view.add(5_000, owner.public_key(), 0, None);

        let tx = TransactionBuilder::v2()
            .spend_ring(5_000, vec![member], hash_bytes(b"forged"), owner.clone())
            .pay(owner.public_key(), 4_900)
            .build();
        let err = validate_transaction(&currency(), &tx, &view, &POOL, &NoConflicts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn test_structure_rejects_bad_shapes() {
        let currency = currency();
        let owner = PrivateKey::generate();
        let mut tx = TransactionBuilder::v1()
            .spend_output(hash_bytes(b"x"), 0, owner.clone())
            .pay(owner.public_key(), 1)
            .build();
        tx.signatures.clear();
        assert_eq!(check_structure(&currency, &tx).unwrap_err().kind(), ErrorKind::MalformedStructure);

        let mut overflow = TransactionBuilder::v1()
            .spend_output(hash_bytes(b"x"), 0, owner.clone())
            .pay(owner.public_key(), u64::MAX)
            .pay(owner.public_key(), 1)
            .build();
        assert_eq!(check_structure(&currency, &overflow).unwrap_err().kind(), ErrorKind::Overflow);

        overflow.outputs = vec![TxOutput::new(0, owner.public_key())];
        assert_eq!(check_structure(&currency, &overflow).unwrap_err().kind(), ErrorKind::MalformedStructure);

        let mut ring = TransactionBuilder::v2()
            .spend_ring(10, vec![3, 3], hash_bytes(b"i"), owner.clone())
            .pay(owner.public_key(), 1)
            .build();
        assert!(check_structure(&currency, &ring).is_err());
        ring.version = 9;
        assert!(check_structure(&currency, &ring).is_err());
    }
}
