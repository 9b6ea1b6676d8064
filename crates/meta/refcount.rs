//! Refcount protocol (`§4.2`): update-first, insert-on-miss. Since this
//! workspace targets a single writer (see Non-goals on multi-writer
//! concurrency), the primary-key-collision retry the reference
//! implementation performs can never actually trigger here; the shape
//! of the protocol is kept anyway because it is what callers describe
//! and it costs nothing extra.
use backym_db::{Transaction, Tree, TxError, TxOpError};
use backym_util::error::Error;
use chrono::Local;

use crate::model::RefCount;

/// A refcount mutation can fail either because the underlying store
/// faulted, or because of a business-level invariant violation
/// (decrementing a row that doesn't exist). `TxOpError` cannot be built
/// outside `backym_db`, so business faults are carried separately and
/// folded into `TxError::Abort` at the edge.
pub(crate) enum RefcountFault {
	Storage(TxOpError),
	Dangling(String),
}

impl From<TxOpError> for RefcountFault {
	fn from(e: TxOpError) -> Self {
		RefcountFault::Storage(e)
	}
}

impl From<RefcountFault> for TxError<Error> {
	fn from(f: RefcountFault) -> Self {
		match f {
			RefcountFault::Storage(e) => e.into(),
			RefcountFault::Dangling(uid) => TxError::Abort(Error::DanglingRefcount(uid)),
		}
	}
}

pub(crate) fn ref_add(
	tx: &mut Transaction<'_>,
	rc_tree: &Tree,
	uid: &str,
) -> Result<(), RefcountFault> {
	let now = Local::now();
	let existing = tx.get(rc_tree, uid.as_bytes())?;
	let updated = match existing {
		Some(bytes) => {
			let mut rc: RefCount = serde_json::from_slice(&bytes).expect("corrupt refcount row");
			rc.refs += 1;
			rc.modified = now;
			rc
		}
		None => RefCount {
			refs: 1,
			modified: now,
		},
	};
	tx.insert(
		rc_tree,
		uid.as_bytes(),
		serde_json::to_vec(&updated).expect("serialize refcount"),
	)?;
	Ok(())
}

pub(crate) fn ref_del(
	tx: &mut Transaction<'_>,
	rc_tree: &Tree,
	uid: &str,
) -> Result<(), RefcountFault> {
	let existing = tx.get(rc_tree, uid.as_bytes())?;
	let mut rc: RefCount = match existing {
		Some(bytes) => serde_json::from_slice(&bytes).expect("corrupt refcount row"),
		None => return Err(RefcountFault::Dangling(uid.to_string())),
	};
	if rc.refs == 0 {
		return Err(RefcountFault::Dangling(uid.to_string()));
	}
	rc.refs -= 1;
	rc.modified = Local::now();
	tx.insert(
		rc_tree,
		uid.as_bytes(),
		serde_json::to_vec(&rc).expect("serialize refcount"),
	)?;
	Ok(())
}

pub(crate) fn get(rc_tree: &Tree, uid: &str) -> Result<Option<RefCount>, Error> {
	match rc_tree.get(uid.as_bytes())? {
		Some(bytes) => Ok(Some(
			serde_json::from_slice(&bytes).expect("corrupt refcount row"),
		)),
		None => Ok(None),
	}
}
