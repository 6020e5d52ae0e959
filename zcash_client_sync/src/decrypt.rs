//! Trial decryption of compact Orchard actions with a full viewing key.

use orchard::{
    keys::{FullViewingKey, PreparedIncomingViewingKey, Scope},
    note::{ExtractedNoteCommitment, Nullifier as OrchardNullifier},
    note_encryption::{CompactAction, OrchardDomain},
};
use zcash_note_encryption::{try_compact_note_decryption, EphemeralKeyBytes};

use crate::{
    proto::compact_formats::{CompactBlock, CompactOrchardAction},
    scanning::{ActionDecoder, DecodeError, DecodedAction},
    wallet::Nullifier,
};

const COMPACT_NOTE_SIZE: usize = 52;

/// An [`ActionDecoder`] that detects notes received by either scope of an Orchard full
/// viewing key.
pub struct OrchardDecoder {
    fvk: FullViewingKey,
    ivks: [PreparedIncomingViewingKey; 2],
}

impl OrchardDecoder {
    pub fn new(fvk: FullViewingKey) -> Self {
        let ivks = [Scope::External, Scope::Internal]
            .map(|scope| PreparedIncomingViewingKey::new(&fvk.to_ivk(scope)));
        OrchardDecoder { fvk, ivks }
    }

    /// Parses a full viewing key from its 96-byte encoding.
    pub fn from_fvk_bytes(bytes: &[u8; 96]) -> Option<Self> {
        FullViewingKey::from_bytes(bytes).map(Self::new)
    }

    /// Returns the compact form of `action`, or `None` if any of its fields is malformed.
    fn parse(action: &CompactOrchardAction) -> Option<CompactAction> {
        let nf = Option::from(OrchardNullifier::from_bytes(
            &action.nullifier.as_slice().try_into().ok()?,
        ))?;
        let cmx = Option::from(ExtractedNoteCommitment::from_bytes(
            &action.cmx.as_slice().try_into().ok()?,
        ))?;
        let epk = EphemeralKeyBytes(action.ephemeral_key.as_slice().try_into().ok()?);
        let ciphertext: [u8; COMPACT_NOTE_SIZE] = action.ciphertext.as_slice().try_into().ok()?;
        Some(CompactAction::from_parts(nf, cmx, epk, ciphertext))
    }

    fn decode_action(&self, action: &CompactOrchardAction) -> Option<DecodedAction> {
        let action = Self::parse(action)?;
        let domain = OrchardDomain::for_compact_action(&action);
        self.ivks.iter().find_map(|ivk| {
            try_compact_note_decryption(&domain, ivk, &action).map(|(note, _)| {
                DecodedAction::from_parts(
                    Nullifier(note.nullifier(&self.fvk).to_bytes()),
                    note.value().inner(),
                )
            })
        })
    }
}

impl ActionDecoder for OrchardDecoder {
    fn decode_block(
        &self,
        block: &CompactBlock,
    ) -> Result<Vec<Option<DecodedAction>>, DecodeError> {
        Ok(block
            .orchard_actions()
            .map(|action| self.decode_action(action))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use orchard::{
        keys::{FullViewingKey, Scope, SpendingKey},
        note::{ExtractedNoteCommitment, Note, Nullifier as OrchardNullifier, RandomSeed, Rho},
        note_encryption::OrchardDomain,
        value::NoteValue,
    };
    use zcash_note_encryption::{Domain, NoteEncryption};

    use super::{OrchardDecoder, COMPACT_NOTE_SIZE};
    use crate::{
        proto::compact_formats::{CompactBlock, CompactOrchardAction, CompactTx},
        scanning::{ActionDecoder, DecodedAction},
        wallet::Nullifier,
    };

    /// Creates a note of `value` zatoshis paying `fvk` in `scope`, and the compact action
    /// that carries it. `seed` selects the spent nullifier and the note randomness.
    fn compact_action(
        fvk: &FullViewingKey,
        scope: Scope,
        value: u64,
        seed: u8,
    ) -> (Note, CompactOrchardAction) {
        let nf_old = OrchardNullifier::from_bytes(&[seed; 32]).unwrap();
        let rho = Rho::from_bytes(&nf_old.to_bytes()).unwrap();
        let rseed = RandomSeed::from_bytes([seed.wrapping_add(1); 32], &rho).unwrap();
        let note = Note::from_parts(
            fvk.address_at(0u32, scope),
            NoteValue::from_raw(value),
            rho,
            rseed,
        )
        .unwrap();

        let encryptor =
            NoteEncryption::<OrchardDomain>::new(Some(fvk.to_ovk(scope)), note, [0xf6; 512]);
        let enc_ciphertext = encryptor.encrypt_note_plaintext();
        let action = CompactOrchardAction {
            nullifier: nf_old.to_bytes().to_vec(),
            cmx: ExtractedNoteCommitment::from(note.commitment())
                .to_bytes()
                .to_vec(),
            ephemeral_key: OrchardDomain::epk_bytes(encryptor.epk()).0.to_vec(),
            ciphertext: enc_ciphertext.as_ref()[..COMPACT_NOTE_SIZE].to_vec(),
        };
        (note, action)
    }

    #[test]
    fn notes_to_either_scope_are_decrypted() {
        let sk = SpendingKey::from_bytes([7; 32]).unwrap();
        let fvk = FullViewingKey::from(&sk);
        let decoder = OrchardDecoder::new(fvk.clone());

        let (external, external_action) = compact_action(&fvk, Scope::External, 50_000, 1);
        let (internal, internal_action) = compact_action(&fvk, Scope::Internal, 7, 2);

        let other = FullViewingKey::from(&SpendingKey::from_bytes([8; 32]).unwrap());
        let (_, foreign_action) = compact_action(&other, Scope::External, 10, 3);

        let block = CompactBlock {
            height: 2_000_000,
            vtx: vec![CompactTx {
                actions: vec![external_action, foreign_action, internal_action],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            decoder.decode_block(&block).unwrap(),
            vec![
                Some(DecodedAction::from_parts(
                    Nullifier(external.nullifier(&fvk).to_bytes()),
                    50_000
                )),
                None,
                Some(DecodedAction::from_parts(
                    Nullifier(internal.nullifier(&fvk).to_bytes()),
                    7
                )),
            ]
        );
    }

    #[test]
    fn malformed_and_foreign_actions_are_not_decrypted() {
        let sk = SpendingKey::from_bytes([7; 32]).unwrap();
        let decoder = OrchardDecoder::new(FullViewingKey::from(&sk));

        let block = CompactBlock {
            height: 2_000_000,
            vtx: vec![CompactTx {
                actions: vec![
                    CompactOrchardAction {
                        nullifier: vec![0; 31],
                        cmx: vec![0; 32],
                        ephemeral_key: vec![0; 32],
                        ciphertext: vec![0; 52],
                    },
                    CompactOrchardAction {
                        nullifier: vec![0; 32],
                        cmx: vec![0; 32],
                        ephemeral_key: vec![0; 32],
                        ciphertext: vec![0; 52],
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(decoder.decode_block(&block).unwrap(), vec![None, None]);
    }
}
