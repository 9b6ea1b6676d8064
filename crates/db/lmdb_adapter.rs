use core::ops::Bound;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use heed::types::ByteSlice;
use heed::{Database, Env, RwTxn};

use crate::{
	Db, Error, IDb, ITx, ITxFn, Result, TxError, TxFnResult, TxOpError, TxOpResult, TxResult,
	TxValueIter, Value, ValueIter,
};

pub use heed;

type ByteDb = Database<ByteSlice, ByteSlice>;

// -- err

impl From<heed::Error> for Error {
	fn from(e: heed::Error) -> Error {
		Error(format!("LMDB: {}", e).into())
	}
}

impl From<heed::Error> for TxOpError {
	fn from(e: heed::Error) -> TxOpError {
		TxOpError(e.into())
	}
}

// -- db

pub struct LmdbDb {
	db: Env,
	trees: RwLock<(Vec<ByteDb>, HashMap<String, usize>)>,
}

impl LmdbDb {
	pub fn init(db: Env) -> Db {
		let s = Self {
			db,
			trees: RwLock::new((Vec::new(), HashMap::new())),
		};
		Db(Arc::new(s))
	}

	fn get_tree(&self, i: usize) -> Result<ByteDb> {
		self.trees
			.read()
			.unwrap()
			.0
			.get(i)
			.cloned()
			.ok_or_else(|| Error("invalid tree id".into()))
	}
}

impl IDb for LmdbDb {
	fn engine(&self) -> String {
		"lmdb (using heed crate)".into()
	}

	fn open_tree(&self, name: &str) -> Result<usize> {
		let mut trees = self.trees.write().unwrap();
		if let Some(i) = trees.1.get(name) {
			Ok(*i)
		} else {
			let mut wtxn = self.db.write_txn()?;
			let tree: ByteDb = self.db.create_database(&mut wtxn, Some(name))?;
			wtxn.commit()?;

			let i = trees.0.len();
			trees.0.push(tree);
			trees.1.insert(name.to_string(), i);
			Ok(i)
		}
	}

	fn list_trees(&self) -> Result<Vec<String>> {
		Ok(self.trees.read().unwrap().1.keys().cloned().collect())
	}

	fn tree_name(&self, tree: usize) -> Option<String> {
		self.trees
			.read()
			.unwrap()
			.1
			.iter()
			.find(|(_, v)| **v == tree)
			.map(|(k, _)| k.clone())
	}

	// ----

	fn get(&self, tree: usize, key: &[u8]) -> Result<Option<Value>> {
		let tree = self.get_tree(tree)?;
		let rtxn = self.db.read_txn()?;
		Ok(tree.get(&rtxn, key)?.map(|v| v.to_vec()))
	}

	fn len(&self, tree: usize) -> Result<usize> {
		let tree = self.get_tree(tree)?;
		let rtxn = self.db.read_txn()?;
		Ok(tree.len(&rtxn)? as usize)
	}

	fn insert(&self, tree: usize, key: &[u8], value: &[u8]) -> Result<Option<Value>> {
		let tree = self.get_tree(tree)?;
		let mut wtxn = self.db.write_txn()?;
		let old = tree.get(&wtxn, key)?.map(|v| v.to_vec());
		tree.put(&mut wtxn, key, value)?;
		wtxn.commit()?;
		Ok(old)
	}

	fn remove(&self, tree: usize, key: &[u8]) -> Result<Option<Value>> {
		let tree = self.get_tree(tree)?;
		let mut wtxn = self.db.write_txn()?;
		let old = tree.get(&wtxn, key)?.map(|v| v.to_vec());
		tree.delete(&mut wtxn, key)?;
		wtxn.commit()?;
		Ok(old)
	}

	fn clear(&self, tree: usize) -> Result<()> {
		let tree = self.get_tree(tree)?;
		let mut wtxn = self.db.write_txn()?;
		tree.clear(&mut wtxn)?;
		wtxn.commit()?;
		Ok(())
	}

	fn iter(&self, tree: usize) -> Result<ValueIter<'_>> {
		let tree = self.get_tree(tree)?;
		let rtxn = self.db.read_txn()?;
		let items: Vec<_> = tree
			.iter(&rtxn)?
			.map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Into::into))
			.collect();
		Ok(Box::new(items.into_iter()))
	}

	fn iter_rev(&self, tree: usize) -> Result<ValueIter<'_>> {
		let tree = self.get_tree(tree)?;
		let rtxn = self.db.read_txn()?;
		let items: Vec<_> = tree
			.rev_iter(&rtxn)?
			.map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Into::into))
			.collect();
		Ok(Box::new(items.into_iter()))
	}

	fn range<'r>(
		&self,
		tree: usize,
		low: Bound<&'r [u8]>,
		high: Bound<&'r [u8]>,
	) -> Result<ValueIter<'_>> {
		let tree = self.get_tree(tree)?;
		let rtxn = self.db.read_txn()?;
		let range = (to_owned_bound(low), to_owned_bound(high));
		let items: Vec<_> = tree
			.range(&rtxn, &range)?
			.map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Into::into))
			.collect();
		Ok(Box::new(items.into_iter()))
	}
	fn range_rev<'r>(
		&self,
		tree: usize,
		low: Bound<&'r [u8]>,
		high: Bound<&'r [u8]>,
	) -> Result<ValueIter<'_>> {
		let tree = self.get_tree(tree)?;
		let rtxn = self.db.read_txn()?;
		let range = (to_owned_bound(low), to_owned_bound(high));
		let items: Vec<_> = tree
			.rev_range(&rtxn, &range)?
			.map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Into::into))
			.collect();
		Ok(Box::new(items.into_iter()))
	}

	// ----

	fn transaction(&self, f: &dyn ITxFn) -> TxResult<(), ()> {
		let trees = self.trees.read().unwrap();
		let mut wtxn = self.db.write_txn().map_err(Error::from).map_err(TxError::Db)?;
		let mut tx = LmdbTx {
			trees: &trees.0[..],
			tx: &mut wtxn,
		};

		match f.try_on(&mut tx) {
			TxFnResult::Ok => {
				wtxn.commit().map_err(Error::from).map_err(TxError::Db)?;
				Ok(())
			}
			TxFnResult::Abort => Err(TxError::Abort(())),
			TxFnResult::DbErr => Err(TxError::Db(Error(
				"(this message will be discarded)".into(),
			))),
		}
	}
}

fn to_owned_bound(b: Bound<&[u8]>) -> Bound<Vec<u8>> {
	match b {
		Bound::Included(v) => Bound::Included(v.to_vec()),
		Bound::Excluded(v) => Bound::Excluded(v.to_vec()),
		Bound::Unbounded => Bound::Unbounded,
	}
}

// ----

struct LmdbTx<'a, 'db> {
	trees: &'db [ByteDb],
	tx: &'a mut RwTxn<'db>,
}

impl<'a, 'db> LmdbTx<'a, 'db> {
	fn get_tree(&self, i: usize) -> TxOpResult<&ByteDb> {
		self.trees.get(i).ok_or_else(|| {
			TxOpError(Error(
				"invalid tree id (it might have been openned after the transaction started)".into(),
			))
		})
	}
}

impl<'a, 'db> ITx for LmdbTx<'a, 'db> {
	fn get(&self, tree: usize, key: &[u8]) -> TxOpResult<Option<Value>> {
		let tree = self.get_tree(tree)?;
		Ok(tree.get(self.tx, key)?.map(|v| v.to_vec()))
	}
	fn len(&self, tree: usize) -> TxOpResult<usize> {
		let tree = self.get_tree(tree)?;
		Ok(tree.len(self.tx)? as usize)
	}

	fn insert(&mut self, tree: usize, key: &[u8], value: &[u8]) -> TxOpResult<Option<Value>> {
		let tree = self.get_tree(tree)?.clone();
		let old = tree.get(self.tx, key)?.map(|v| v.to_vec());
		tree.put(self.tx, key, value)?;
		Ok(old)
	}
	fn remove(&mut self, tree: usize, key: &[u8]) -> TxOpResult<Option<Value>> {
		let tree = self.get_tree(tree)?.clone();
		let old = tree.get(self.tx, key)?.map(|v| v.to_vec());
		tree.delete(self.tx, key)?;
		Ok(old)
	}

	fn iter(&self, _tree: usize) -> TxOpResult<TxValueIter<'_>> {
		unimplemented!("Iterators in transactions not supported with LMDB backend");
	}
	fn iter_rev(&self, _tree: usize) -> TxOpResult<TxValueIter<'_>> {
		unimplemented!("Iterators in transactions not supported with LMDB backend");
	}

	fn range<'r>(
		&self,
		_tree: usize,
		_low: Bound<&'r [u8]>,
		_high: Bound<&'r [u8]>,
	) -> TxOpResult<TxValueIter<'_>> {
		unimplemented!("Iterators in transactions not supported with LMDB backend");
	}
	fn range_rev<'r>(
		&self,
		_tree: usize,
		_low: Bound<&'r [u8]>,
		_high: Bound<&'r [u8]>,
	) -> TxOpResult<TxValueIter<'_>> {
		unimplemented!("Iterators in transactions not supported with LMDB backend");
	}
}
