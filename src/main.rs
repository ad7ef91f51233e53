/* imports */
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::ops::Deref;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::sync::OnceLock;
use std::time::Instant;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal;
use ordered_float::OrderedFloat;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/* constants */
const BIND_ADDR: &str = "0.0.0.0:1234";
const BACKLOG: i32 = 128;

// Largest request body accepted and largest response body produced.
const K_MAX_MSG: usize = 32 << 20;
// Upper bound on the argument count of a single request.
const K_MAX_ARGS: usize = 200_000;
// Maximum average chain length before the keyspace grows.
// A value > 1 is valid because multiple entries can share one bucket.
const K_MAX_LOAD_FACTOR: usize = 8;
// Entries migrated from the old table per keyspace operation.
const K_REHASHING_WORK: usize = 128;
// Connections idle longer than this are reaped.
const K_IDLE_TIMEOUT_MS: u64 = 5_000;
// Single read() chunk in handle_read.
const K_READ_CHUNK: usize = 64 * 1024;

/* buffered byte queue */

// FIFO of bytes with O(1) front consumption. `start..end` is the live
// region; consumed space at the front is reclaimed on the next append.
struct Buffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl Buffer {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            start: 0,
            end: 0,
        }
    }

    fn data(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn append(&mut self, chunk: &[u8]) {
        if self.end + chunk.len() > self.data.len() {
            self.make_room(chunk.len());
        }
        self.data[self.end..self.end + chunk.len()].copy_from_slice(chunk);
        self.end += chunk.len();
    }

    // Remove n bytes from the front without shifting the rest.
    fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "cannot consume more bytes than buffered");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    // First n bytes, if that many are buffered.
    fn peek(&self, n: usize) -> Option<&[u8]> {
        if n <= self.len() {
            Some(&self.data[self.start..self.start + n])
        } else {
            None
        }
    }

    // Make space for an append by sliding the live region to the front,
    // or by growing the storage when even that is not enough.
    fn make_room(&mut self, needed: usize) {
        let len = self.len();
        if self.start + (self.data.len() - self.end) >= needed {
            self.data.copy_within(self.start..self.end, 0);
        } else {
            let grown_size = (self.data.len() * 2).max(len + needed).max(4096);
            let mut grown = vec![0u8; grown_size];
            grown[..len].copy_from_slice(&self.data[self.start..self.end]);
            self.data = grown;
        }
        self.start = 0;
        self.end = len;
    }

    fn append_u8(&mut self, v: u8) {
        self.append(&[v]);
    }

    fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    fn append_i64(&mut self, v: i64) {
        self.append(&v.to_le_bytes());
    }

    fn append_f64(&mut self, v: f64) {
        self.append(&v.to_le_bytes());
    }

    // Reserve the 4-byte length header of a response frame. Returns the
    // header position relative to the logical start of the buffer, so it
    // stays valid if earlier responses are consumed in the meantime.
    fn response_begin(&mut self) -> usize {
        let header_pos = self.len();
        self.append_u32(0);
        header_pos
    }

    // Backpatch the reserved header with the final body length. An
    // oversized body is cut back to nothing and replaced by an error.
    fn response_end(&mut self, header_pos: usize) {
        let mut body_len = self.len() - header_pos - 4;
        if body_len > K_MAX_MSG {
            self.end = self.start + header_pos + 4;
            out_err(self, ErrCode::TooBig, "response too big.");
            body_len = self.len() - header_pos - 4;
        }
        let at = self.start + header_pos;
        self.data[at..at + 4].copy_from_slice(&(body_len as u32).to_le_bytes());
    }

    // Arrays carry their element count up front; when the count is not
    // known in advance it is patched in afterwards.
    fn begin_arr(&mut self) -> usize {
        self.append_u8(Tag::Arr as u8);
        let ctx = self.len();
        self.append_u32(0);
        ctx
    }

    fn end_arr(&mut self, ctx: usize, n: u32) {
        debug_assert_eq!(self.data[self.start + ctx - 1], Tag::Arr as u8);
        let at = self.start + ctx;
        self.data[at..at + 4].copy_from_slice(&n.to_le_bytes());
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

/* keyspace */

fn hash_bytes(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

enum Value {
    Str(Vec<u8>),
    ZSet(ZSet),
}

// One keyspace binding. The hash code is computed once at creation and
// compared before the key bytes on every probe.
struct Entry {
    link: LinkedListLink,
    hcode: u64,
    key: Vec<u8>,
    value: Value,
}

impl Entry {
    fn new(key: Vec<u8>, value: Value) -> Box<Self> {
        let hcode = hash_bytes(&key);
        Box::new(Self {
            link: LinkedListLink::new(),
            hcode,
            key,
            value,
        })
    }
}

intrusive_adapter!(EntryAdapter = Box<Entry>: Entry { link: LinkedListLink });

// Fixed-size chaining hash table. Entries live in per-bucket intrusive
// lists, so moving one between tables is a relink, not a reallocation.
struct HashTable {
    tab: Vec<LinkedList<EntryAdapter>>,
    mask: usize,
    size: usize,
}

impl HashTable {
    fn new(n_buckets: usize) -> Self {
        assert!(n_buckets.is_power_of_two());
        let tab = (0..n_buckets)
            .map(|_| LinkedList::new(EntryAdapter::new()))
            .collect();
        Self {
            tab,
            mask: n_buckets - 1,
            size: 0,
        }
    }

    fn insert(&mut self, entry: Box<Entry>) {
        let pos = (entry.hcode as usize) & self.mask;
        self.tab[pos].push_front(entry);
        self.size += 1;
    }

    fn lookup(&self, hcode: u64, key: &[u8]) -> Option<&Entry> {
        let pos = (hcode as usize) & self.mask;
        self.tab[pos]
            .iter()
            .find(|entry| entry.hcode == hcode && entry.key.as_slice() == key)
    }

    fn take(&mut self, hcode: u64, key: &[u8]) -> Option<Box<Entry>> {
        let pos = (hcode as usize) & self.mask;
        let mut cursor = self.tab[pos].front_mut();
        while let Some(entry) = cursor.get() {
            if entry.hcode == hcode && entry.key.as_slice() == key {
                let taken = cursor.remove();
                self.size -= 1;
                return taken;
            }
            cursor.move_next();
        }
        None
    }

    fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.tab.iter().flat_map(|bucket| bucket.iter())
    }
}

// The keyspace: two chaining tables with progressive rehashing. When
// `newer` crosses the load threshold it is demoted to `older` and a table
// of twice the size takes its place; every subsequent operation migrates
// a bounded number of entries until `older` drains.
struct HMap {
    newer: HashTable,
    older: Option<HashTable>,
    migrate_pos: usize,
}

impl HMap {
    fn new() -> Self {
        Self {
            newer: HashTable::new(16),
            older: None,
            migrate_pos: 0,
        }
    }

    fn lookup(&mut self, key: &[u8]) -> Option<&Entry> {
        self.migrate_some();
        let hcode = hash_bytes(key);
        match self.newer.lookup(hcode, key) {
            Some(hit) => Some(hit),
            None => self.older.as_ref().and_then(|t| t.lookup(hcode, key)),
        }
    }

    // Unlink and return the entry for `key`, consulting both tables.
    fn take(&mut self, key: &[u8]) -> Option<Box<Entry>> {
        self.migrate_some();
        let hcode = hash_bytes(key);
        if let Some(entry) = self.newer.take(hcode, key) {
            return Some(entry);
        }
        self.older.as_mut().and_then(|t| t.take(hcode, key))
    }

    fn insert(&mut self, entry: Box<Entry>) {
        self.newer.insert(entry);
        if self.older.is_none() {
            let threshold = (self.newer.mask + 1) * K_MAX_LOAD_FACTOR;
            if self.newer.size >= threshold {
                self.begin_rehash();
            }
        }
        self.migrate_some();
    }

    fn size(&self) -> usize {
        self.newer.size + self.older.as_ref().map_or(0, |t| t.size)
    }

    fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.newer
            .iter()
            .chain(self.older.iter().flat_map(|t| t.iter()))
    }

    fn begin_rehash(&mut self) {
        let bigger = HashTable::new((self.newer.mask + 1) * 2);
        self.older = Some(std::mem::replace(&mut self.newer, bigger));
        self.migrate_pos = 0;
    }

    // Move up to K_REHASHING_WORK entries from the old table to the new
    // one, keeping the pause per operation bounded.
    fn migrate_some(&mut self) {
        let mut nwork = 0;
        loop {
            let Some(older) = self.older.as_mut() else { return };
            if nwork >= K_REHASHING_WORK || older.size == 0 {
                break;
            }
            if older.tab[self.migrate_pos].is_empty() {
                self.migrate_pos += 1;
                continue;
            }
            let entry = older.tab[self.migrate_pos]
                .front_mut()
                .remove()
                .expect("bucket is non-empty");
            older.size -= 1;
            self.newer.insert(entry);
            nwork += 1;
        }
        if self.older.as_ref().is_some_and(|t| t.size == 0) {
            self.older = None;
            self.migrate_pos = 0;
        }
    }
}

/* sorted set */

// Null link in the node arena.
const NIL: u32 = u32::MAX;

// One sorted-set member. Tree links are arena indices; `height` and `cnt`
// are maintained for every subtree so rank walks stay O(log n).
struct ZNode {
    parent: u32,
    left: u32,
    right: u32,
    height: u32,
    cnt: u32,
    score: f64,
    name: Box<[u8]>,
}

// Mapping from member name to score with an ordered (score, name) view.
// Two indices over one node arena: a hash map by name and an AVL tree by
// (score, name). Freed slots are recycled through a free list so tree
// links never have to be rewritten when other members are removed.
struct ZSet {
    nodes: Vec<ZNode>,
    free: Vec<u32>,
    root: u32,
    by_name: HashMap<Box<[u8]>, u32>,
}

impl ZSet {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            by_name: HashMap::new(),
        }
    }

    // Insert a member, or rewrite the score of an existing one by pulling
    // it out of the tree and reinserting it at its new rank. Returns true
    // only when the member is new.
    fn insert(&mut self, name: &[u8], score: f64) -> bool {
        if let Some(&idx) = self.by_name.get(name) {
            self.tree_remove(idx);
            self.node_mut(idx).score = score;
            self.tree_insert(idx);
            return false;
        }
        let boxed: Box<[u8]> = name.into();
        let idx = self.alloc(score, boxed.clone());
        self.by_name.insert(boxed, idx);
        self.tree_insert(idx);
        true
    }

    fn score(&self, name: &[u8]) -> Option<f64> {
        self.by_name.get(name).map(|&idx| self.node(idx).score)
    }

    fn remove(&mut self, name: &[u8]) -> bool {
        match self.by_name.remove(name) {
            Some(idx) => {
                self.tree_remove(idx);
                self.free_slot(idx);
                true
            }
            None => false,
        }
    }

    // Smallest member with (score, name) >= the given pair, or NIL.
    fn seek_ge(&self, score: f64, name: &[u8]) -> u32 {
        let mut found = NIL;
        let mut cur = self.root;
        while cur != NIL {
            if self.key_of(cur) < (OrderedFloat(score), name) {
                cur = self.node(cur).right;
            } else {
                found = cur;
                cur = self.node(cur).left;
            }
        }
        found
    }

    // Walk `offset` places through the rank order, steered by subtree
    // counts instead of stepping one successor at a time.
    fn offset(&self, from: u32, offset: i64) -> u32 {
        if from == NIL {
            return NIL;
        }
        let mut cur = from;
        let mut pos = 0i64;
        while pos != offset {
            let rcnt = self.cnt(self.node(cur).right) as i64;
            let lcnt = self.cnt(self.node(cur).left) as i64;
            if pos < offset && offset <= pos + rcnt {
                // target is inside the right subtree
                cur = self.node(cur).right;
                pos += self.cnt(self.node(cur).left) as i64 + 1;
            } else if pos > offset && offset >= pos - lcnt {
                // target is inside the left subtree
                cur = self.node(cur).left;
                pos -= self.cnt(self.node(cur).right) as i64 + 1;
            } else {
                let parent = self.node(cur).parent;
                if parent == NIL {
                    return NIL;
                }
                if self.node(parent).right == cur {
                    pos -= lcnt + 1;
                } else {
                    pos += rcnt + 1;
                }
                cur = parent;
            }
        }
        cur
    }

    fn node(&self, idx: u32) -> &ZNode {
        &self.nodes[idx as usize]
    }

    fn node_mut(&mut self, idx: u32) -> &mut ZNode {
        &mut self.nodes[idx as usize]
    }

    fn height(&self, idx: u32) -> u32 {
        if idx == NIL {
            0
        } else {
            self.node(idx).height
        }
    }

    fn cnt(&self, idx: u32) -> u32 {
        if idx == NIL {
            0
        } else {
            self.node(idx).cnt
        }
    }

    fn key_of(&self, idx: u32) -> (OrderedFloat<f64>, &[u8]) {
        let node = self.node(idx);
        (OrderedFloat(node.score), &node.name)
    }

    fn alloc(&mut self, score: f64, name: Box<[u8]>) -> u32 {
        let node = ZNode {
            parent: NIL,
            left: NIL,
            right: NIL,
            height: 1,
            cnt: 1,
            score,
            name,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn free_slot(&mut self, idx: u32) {
        self.node_mut(idx).name = Box::default();
        self.free.push(idx);
    }

    fn update(&mut self, idx: u32) {
        let node = self.node(idx);
        let (l, r) = (node.left, node.right);
        let height = 1 + self.height(l).max(self.height(r));
        let cnt = 1 + self.cnt(l) + self.cnt(r);
        let node = self.node_mut(idx);
        node.height = height;
        node.cnt = cnt;
    }

    fn rot_left(&mut self, x: u32) -> u32 {
        let y = self.node(x).right;
        let inner = self.node(y).left;
        let parent = self.node(x).parent;
        self.node_mut(x).right = inner;
        if inner != NIL {
            self.node_mut(inner).parent = x;
        }
        self.node_mut(y).parent = parent;
        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;
        self.update(x);
        self.update(y);
        y
    }

    fn rot_right(&mut self, x: u32) -> u32 {
        let y = self.node(x).left;
        let inner = self.node(y).right;
        let parent = self.node(x).parent;
        self.node_mut(x).left = inner;
        if inner != NIL {
            self.node_mut(inner).parent = x;
        }
        self.node_mut(y).parent = parent;
        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;
        self.update(x);
        self.update(y);
        y
    }

    // The left subtree is two levels deeper; a left-right shape needs a
    // double rotation.
    fn fix_left(&mut self, x: u32) -> u32 {
        let l = self.node(x).left;
        if self.height(self.node(l).left) < self.height(self.node(l).right) {
            let new_left = self.rot_left(l);
            self.node_mut(x).left = new_left;
        }
        self.rot_right(x)
    }

    fn fix_right(&mut self, x: u32) -> u32 {
        let r = self.node(x).right;
        if self.height(self.node(r).right) < self.height(self.node(r).left) {
            let new_right = self.rot_right(r);
            self.node_mut(x).right = new_right;
        }
        self.rot_left(x)
    }

    // Restore the augmented data and the balance invariant on the path
    // from `idx` to the root. Returns the new root.
    fn fix(&mut self, mut idx: u32) -> u32 {
        loop {
            self.update(idx);
            let l = self.height(self.node(idx).left);
            let r = self.height(self.node(idx).right);
            let parent = self.node(idx).parent;
            let from_left = parent != NIL && self.node(parent).left == idx;
            let fixed = if l == r + 2 {
                self.fix_left(idx)
            } else if l + 2 == r {
                self.fix_right(idx)
            } else {
                idx
            };
            if parent == NIL {
                return fixed;
            }
            if from_left {
                self.node_mut(parent).left = fixed;
            } else {
                self.node_mut(parent).right = fixed;
            }
            idx = parent;
        }
    }

    fn tree_insert(&mut self, idx: u32) {
        let mut parent = NIL;
        let mut cur = self.root;
        let mut go_left = false;
        while cur != NIL {
            parent = cur;
            go_left = self.key_of(idx) < self.key_of(cur);
            cur = if go_left {
                self.node(cur).left
            } else {
                self.node(cur).right
            };
        }
        self.node_mut(idx).parent = parent;
        if parent == NIL {
            self.root = idx;
            return;
        }
        if go_left {
            self.node_mut(parent).left = idx;
        } else {
            self.node_mut(parent).right = idx;
        }
        self.root = self.fix(idx);
    }

    // Unlink `idx` from the ordered index. The arena slot stays allocated
    // and its links are reset, so the node can be reinserted (score
    // update) or freed (removal) by the caller.
    fn tree_remove(&mut self, idx: u32) {
        let (l, r) = {
            let node = self.node(idx);
            (node.left, node.right)
        };
        if l == NIL || r == NIL {
            self.root = self.del_easy(idx);
        } else {
            let mut succ = r;
            while self.node(succ).left != NIL {
                succ = self.node(succ).left;
            }
            self.root = self.del_two_children(idx, succ);
        }
        let node = self.node_mut(idx);
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
        node.height = 1;
        node.cnt = 1;
    }

    // Delete a node with at most one child: splice the child into its
    // place and rebalance from the parent. Returns the new tree root.
    fn del_easy(&mut self, x: u32) -> u32 {
        let node = self.node(x);
        let child = if node.left != NIL { node.left } else { node.right };
        let parent = node.parent;
        if child != NIL {
            self.node_mut(child).parent = parent;
        }
        if parent == NIL {
            return child;
        }
        if self.node(parent).left == x {
            self.node_mut(parent).left = child;
        } else {
            self.node_mut(parent).right = child;
        }
        self.fix(parent)
    }

    // Delete a node with two children: relink the in-order successor into
    // its position, so no payload moves and indices held by the name map
    // stay valid. `succ` has no left child by construction.
    fn del_two_children(&mut self, x: u32, succ: u32) -> u32 {
        let succ_parent = self.node(succ).parent;
        let succ_right = self.node(succ).right;
        let fix_from = if succ_parent == x { succ } else { succ_parent };
        if succ_parent != x {
            self.node_mut(succ_parent).left = succ_right;
            if succ_right != NIL {
                self.node_mut(succ_right).parent = succ_parent;
            }
            let xr = self.node(x).right;
            self.node_mut(succ).right = xr;
            self.node_mut(xr).parent = succ;
        }
        let xl = self.node(x).left;
        self.node_mut(succ).left = xl;
        self.node_mut(xl).parent = succ;
        let xp = self.node(x).parent;
        self.node_mut(succ).parent = xp;
        if xp != NIL {
            if self.node(xp).left == x {
                self.node_mut(xp).left = succ;
            } else {
                self.node_mut(xp).right = succ;
            }
        }
        self.fix(fix_from)
    }
}

// Read-only ZSet commands treat a missing key as an empty set; this is
// the shared instance they all borrow. It is never mutated.
fn empty_zset() -> &'static ZSet {
    static EMPTY: OnceLock<ZSet> = OnceLock::new();
    EMPTY.get_or_init(ZSet::new)
}

/* wire protocol */

// Reply type discriminators.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum Tag {
    Nil = 0,
    Err = 1,
    Str = 2,
    Int = 3,
    Dbl = 4,
    Arr = 5,
}

// In-band error codes carried by ERR replies.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u32)]
enum ErrCode {
    Unknown = 1,
    TooBig = 2,
    BadTyp = 3,
    BadArg = 4,
}

fn out_nil(out: &mut Buffer) {
    out.append_u8(Tag::Nil as u8);
}

fn out_str(out: &mut Buffer, s: &[u8]) {
    out.append_u8(Tag::Str as u8);
    out.append_u32(s.len() as u32);
    out.append(s);
}

fn out_int(out: &mut Buffer, v: i64) {
    out.append_u8(Tag::Int as u8);
    out.append_i64(v);
}

fn out_dbl(out: &mut Buffer, v: f64) {
    out.append_u8(Tag::Dbl as u8);
    out.append_f64(v);
}

fn out_arr(out: &mut Buffer, n: u32) {
    out.append_u8(Tag::Arr as u8);
    out.append_u32(n);
}

fn out_err(out: &mut Buffer, code: ErrCode, msg: &str) {
    out.append_u8(Tag::Err as u8);
    out.append_u32(code as u32);
    out.append_u32(msg.len() as u32);
    out.append(msg.as_bytes());
}

// Violations of the request framing. Any of these closes the connection;
// malformed bytes leave no way to find the next frame boundary.
#[derive(Debug, Error, PartialEq)]
enum ProtocolError {
    #[error("request body of {0} bytes is too long")]
    MsgTooLong(usize),
    #[error("request declares {0} arguments")]
    TooManyArgs(usize),
    #[error("argument record is truncated")]
    Truncated,
    #[error("trailing bytes after the last argument")]
    TrailingGarbage,
    #[error("empty argument vector")]
    EmptyRequest,
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}

// Split a request body into its argument records: a u32 count followed by
// that many length-prefixed byte strings, with nothing left over.
fn parse_request(body: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let nstr = read_u32(body, 0).ok_or(ProtocolError::Truncated)? as usize;
    if nstr > K_MAX_ARGS {
        return Err(ProtocolError::TooManyArgs(nstr));
    }
    if nstr == 0 {
        return Err(ProtocolError::EmptyRequest);
    }
    let mut args = Vec::with_capacity(nstr);
    let mut at = 4;
    for _ in 0..nstr {
        let len = read_u32(body, at).ok_or(ProtocolError::Truncated)? as usize;
        at += 4;
        if body.len() - at < len {
            return Err(ProtocolError::Truncated);
        }
        args.push(body[at..at + len].to_vec());
        at += len;
    }
    if at != body.len() {
        return Err(ProtocolError::TrailingGarbage);
    }
    Ok(args)
}

// Serve every complete request buffered in `incoming`, appending one
// framed reply per request to `outgoing`. Stops at the first incomplete
// frame; a pipelining client gets its replies batched in arrival order.
fn drain_requests(
    db: &mut HMap,
    incoming: &mut Buffer,
    outgoing: &mut Buffer,
) -> Result<(), ProtocolError> {
    loop {
        let Some(header) = incoming.peek(4) else {
            return Ok(());
        };
        let body_len = u32::from_le_bytes(header.try_into().expect("4-byte header")) as usize;
        if body_len > K_MAX_MSG {
            return Err(ProtocolError::MsgTooLong(body_len));
        }
        let Some(frame) = incoming.peek(4 + body_len) else {
            return Ok(());
        };
        let args = parse_request(&frame[4..])?;
        incoming.consume(4 + body_len);
        let header_pos = outgoing.response_begin();
        do_request(db, &args, outgoing);
        outgoing.response_end(header_pos);
    }
}

/* commands */

fn do_request(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    let name = cmd[0].to_ascii_lowercase();
    match (name.as_slice(), cmd.len()) {
        (b"get", 2) => do_get(db, cmd, out),
        (b"set", 3) => do_set(db, cmd, out),
        (b"del", 2) => do_del(db, cmd, out),
        (b"keys", 1) => do_keys(db, out),
        (b"zadd", 4) => do_zadd(db, cmd, out),
        (b"zrem", 3) => do_zrem(db, cmd, out),
        (b"zscore", 3) => do_zscore(db, cmd, out),
        (b"zquery", 6) => do_zquery(db, cmd, out),
        _ => out_err(out, ErrCode::Unknown, "unknown command."),
    }
}

fn do_get(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    match db.lookup(&cmd[1]) {
        None => out_nil(out),
        Some(entry) => match &entry.value {
            Value::Str(v) => out_str(out, v),
            Value::ZSet(_) => out_err(out, ErrCode::BadTyp, "not a string value"),
        },
    }
}

fn do_set(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    let (key, val) = (&cmd[1], &cmd[2]);
    if matches!(db.lookup(key), Some(e) if !matches!(e.value, Value::Str(_))) {
        out_err(out, ErrCode::BadTyp, "a non-string value exists");
        return;
    }
    // entries cannot be modified through the bucket chain, so updates go
    // through take-modify-reinsert
    let mut entry = match db.take(key) {
        Some(entry) => entry,
        None => Entry::new(key.clone(), Value::Str(Vec::new())),
    };
    entry.value = Value::Str(val.clone());
    db.insert(entry);
    out_nil(out);
}

fn do_del(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    // dropping the entry releases its payload, sorted-set nodes included
    let existed = db.take(&cmd[1]).is_some();
    out_int(out, existed as i64);
}

fn do_keys(db: &mut HMap, out: &mut Buffer) {
    out_arr(out, db.size() as u32);
    for entry in db.iter() {
        out_str(out, &entry.key);
    }
}

// Read path for ZSet commands: a missing key reads as the shared empty
// set, a key of the wrong type is an error.
fn expect_zset<'a>(db: &'a mut HMap, key: &[u8]) -> Result<&'a ZSet, ()> {
    match db.lookup(key) {
        None => Ok(empty_zset()),
        Some(Entry {
            value: Value::ZSet(zset),
            ..
        }) => Ok(zset),
        Some(_) => Err(()),
    }
}

fn do_zadd(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(score) = parse_float(&cmd[2]) else {
        out_err(out, ErrCode::BadArg, "expect fp number");
        return;
    };
    let (key, member) = (&cmd[1], &cmd[3]);
    let mut entry = match db.take(key) {
        Some(entry) => entry,
        None => Entry::new(key.clone(), Value::ZSet(ZSet::new())),
    };
    match &mut entry.value {
        Value::ZSet(zset) => {
            let added = zset.insert(member, score);
            out_int(out, added as i64);
        }
        Value::Str(_) => out_err(out, ErrCode::BadTyp, "expect zset"),
    }
    db.insert(entry);
}

fn do_zrem(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    let (key, member) = (&cmd[1], &cmd[2]);
    let Some(mut entry) = db.take(key) else {
        // absent key reads as an empty set
        out_int(out, 0);
        return;
    };
    match &mut entry.value {
        Value::ZSet(zset) => {
            let removed = zset.remove(member);
            out_int(out, removed as i64);
        }
        Value::Str(_) => out_err(out, ErrCode::BadTyp, "expect zset"),
    }
    db.insert(entry);
}

fn do_zscore(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    let (key, member) = (&cmd[1], &cmd[2]);
    match expect_zset(db, key) {
        Err(()) => out_err(out, ErrCode::BadTyp, "expect zset"),
        Ok(zset) => match zset.score(member) {
            Some(score) => out_dbl(out, score),
            None => out_nil(out),
        },
    }
}

fn do_zquery(db: &mut HMap, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(score) = parse_float(&cmd[2]) else {
        out_err(out, ErrCode::BadArg, "expect fp number");
        return;
    };
    let name = &cmd[3];
    let (Some(offset), Some(limit)) = (parse_int(&cmd[4]), parse_int(&cmd[5])) else {
        out_err(out, ErrCode::BadArg, "expect int");
        return;
    };
    let zset = match expect_zset(db, &cmd[1]) {
        Ok(zset) => zset,
        Err(()) => {
            out_err(out, ErrCode::BadTyp, "expect zset");
            return;
        }
    };
    if limit <= 0 {
        out_arr(out, 0);
        return;
    }
    let mut cur = zset.offset(zset.seek_ge(score, name), offset);
    let ctx = out.begin_arr();
    let mut n = 0u32;
    while cur != NIL && (n as i64) < limit.saturating_mul(2) {
        let member = zset.node(cur);
        out_str(out, &member.name);
        out_dbl(out, member.score);
        cur = zset.offset(cur, 1);
        n += 2;
    }
    out.end_arr(ctx, n);
}

fn parse_float(arg: &[u8]) -> Option<f64> {
    let parsed: f64 = std::str::from_utf8(arg).ok()?.parse().ok()?;
    parsed.is_finite().then_some(parsed)
}

fn parse_int(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

/* connections */

const NO_FD: RawFd = -1;

struct Conn {
    socket: Socket,
    // what the next poll() should ask for
    want_read: bool,
    want_write: bool,
    want_close: bool,
    incoming: Buffer,
    outgoing: Buffer,
    last_active_ms: u64,
    idle_prev: RawFd,
    idle_next: RawFd,
}

impl Conn {
    fn new(socket: Socket) -> Self {
        Self {
            socket,
            want_read: true,
            want_write: false,
            want_close: false,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
            last_active_ms: monotonic_ms(),
            idle_prev: NO_FD,
            idle_next: NO_FD,
        }
    }
}

fn conn_events(conn: &Conn) -> PollFlags {
    let mut events = PollFlags::POLLERR;
    if conn.want_read {
        events |= PollFlags::POLLIN;
    }
    if conn.want_write {
        events |= PollFlags::POLLOUT;
    }
    events
}

fn conn_mut(conns: &mut [Option<Conn>], fd: RawFd) -> &mut Conn {
    conns[fd as usize].as_mut().expect("live connection for fd")
}

// Live connections in order of increasing last_active_ms; the head is the
// next eviction candidate. The links are fd indices into the connection
// table, so the list holds no ownership and detach stays O(1).
struct IdleList {
    head: RawFd,
    tail: RawFd,
}

impl IdleList {
    fn new() -> Self {
        Self {
            head: NO_FD,
            tail: NO_FD,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == NO_FD
    }

    fn push_back(&mut self, conns: &mut [Option<Conn>], fd: RawFd) {
        let old_tail = self.tail;
        {
            let conn = conn_mut(conns, fd);
            conn.idle_prev = old_tail;
            conn.idle_next = NO_FD;
        }
        if old_tail == NO_FD {
            self.head = fd;
        } else {
            conn_mut(conns, old_tail).idle_next = fd;
        }
        self.tail = fd;
    }

    fn detach(&mut self, conns: &mut [Option<Conn>], fd: RawFd) {
        let (prev, next) = {
            let conn = conn_mut(conns, fd);
            let links = (conn.idle_prev, conn.idle_next);
            conn.idle_prev = NO_FD;
            conn.idle_next = NO_FD;
            links
        };
        if prev == NO_FD {
            self.head = next;
        } else {
            conn_mut(conns, prev).idle_next = next;
        }
        if next == NO_FD {
            self.tail = prev;
        } else {
            conn_mut(conns, next).idle_prev = prev;
        }
    }
}

fn handle_accept(listener: &Socket, conns: &mut Vec<Option<Conn>>, idle: &mut IdleList) {
    let (socket, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
            warn!("accept() failed: {}", e);
            return;
        }
    };
    if let Err(e) = socket.set_nonblocking(true) {
        warn!("cannot set accepted socket non-blocking: {}", e);
        return;
    }
    let fd = socket.as_raw_fd();
    debug!("accepted {:?} on fd {}", peer.as_socket(), fd);
    if fd as usize >= conns.len() {
        conns.resize_with(fd as usize + 1, || None);
    }
    debug_assert!(conns[fd as usize].is_none());
    conns[fd as usize] = Some(Conn::new(socket));
    idle.push_back(conns, fd);
}

fn handle_read(conn: &mut Conn, db: &mut HMap) {
    let mut chunk = [0u8; K_READ_CHUNK];
    match conn.socket.read(&mut chunk) {
        Ok(0) => {
            if conn.incoming.is_empty() {
                debug!("client closed connection");
            } else {
                warn!("unexpected EOF mid-request");
            }
            conn.want_close = true;
            return;
        }
        Ok(n) => conn.incoming.append(&chunk[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
            warn!("read() failed: {}", e);
            conn.want_close = true;
            return;
        }
    }
    if let Err(e) = drain_requests(db, &mut conn.incoming, &mut conn.outgoing) {
        warn!("protocol violation: {}", e);
        conn.want_close = true;
        return;
    }
    if !conn.outgoing.is_empty() {
        conn.want_read = false;
        conn.want_write = true;
        // in a request-response workload the socket is usually writable
        // right away; trying now saves a poll round-trip
        handle_write(conn);
    }
}

fn handle_write(conn: &mut Conn) {
    debug_assert!(!conn.outgoing.is_empty());
    match conn.socket.write(&conn.outgoing) {
        Ok(0) => {
            warn!("write() returned zero");
            conn.want_close = true;
        }
        Ok(n) => {
            conn.outgoing.consume(n);
            if conn.outgoing.is_empty() {
                conn.want_write = false;
                conn.want_read = true;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            warn!("write() failed: {}", e);
            conn.want_close = true;
        }
    }
}

// Emptying the table slot first makes this run at most once per
// connection; dropping the Conn closes its fd.
fn conn_destroy(conns: &mut [Option<Conn>], idle: &mut IdleList, fd: RawFd) {
    idle.detach(conns, fd);
    if conns[fd as usize].take().is_some() {
        debug!("closed connection on fd {}", fd);
    }
}

/* timers */

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

// Poll timeout: the idle deadline of the oldest connection, or infinite
// when nothing is connected.
fn next_timeout_ms(conns: &[Option<Conn>], idle: &IdleList, now: u64) -> i32 {
    if idle.is_empty() {
        return -1;
    }
    let oldest = conns[idle.head as usize]
        .as_ref()
        .expect("live connection for fd");
    let deadline = oldest.last_active_ms + K_IDLE_TIMEOUT_MS;
    deadline.saturating_sub(now) as i32
}

// The list is ordered by last activity, so reaping stops at the first
// connection that has not expired yet.
fn process_timers(conns: &mut [Option<Conn>], idle: &mut IdleList, now: u64) {
    while !idle.is_empty() {
        let fd = idle.head;
        let last_active = conns[fd as usize]
            .as_ref()
            .expect("live connection for fd")
            .last_active_ms;
        if last_active + K_IDLE_TIMEOUT_MS >= now {
            break;
        }
        info!("idle timeout, closing fd {}", fd);
        conn_destroy(conns, idle, fd);
    }
}

/* event loop */

fn run(listener: Socket) -> io::Result<()> {
    let mut db = HMap::new();
    // connection table addressed by fd; may be sparse
    let mut conns: Vec<Option<Conn>> = Vec::new();
    let mut idle = IdleList::new();

    loop {
        let mut poll_fds = Vec::with_capacity(1 + conns.len());
        poll_fds.push(PollFd::new(&listener, PollFlags::POLLIN));
        for conn in conns.iter().flatten() {
            poll_fds.push(PollFd::new(&conn.socket, conn_events(conn)));
        }

        let timeout = next_timeout_ms(&conns, &idle, monotonic_ms());
        if let Err(err) = poll(&mut poll_fds, timeout) {
            if err == Errno::EINTR {
                continue;
            }
            error!("poll() failed: {}", err);
            return Err(io::Error::from_raw_os_error(err as i32));
        }

        let accept_ready = poll_fds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .contains(PollFlags::POLLIN);
        let ready: Vec<(RawFd, PollFlags)> = poll_fds[1..]
            .iter()
            .map(|pfd| {
                (
                    pfd.as_fd().as_raw_fd(),
                    pfd.revents().unwrap_or(PollFlags::empty()),
                )
            })
            .filter(|(_, revents)| !revents.is_empty())
            .collect();
        drop(poll_fds);

        if accept_ready {
            handle_accept(&listener, &mut conns, &mut idle);
        }

        let now = monotonic_ms();
        for (fd, revents) in ready {
            if conns.get(fd as usize).map_or(true, |slot| slot.is_none()) {
                continue;
            }
            // any readiness counts as activity: restamp and requeue at
            // the recent end of the idle list
            conn_mut(&mut conns, fd).last_active_ms = now;
            idle.detach(&mut conns, fd);
            idle.push_back(&mut conns, fd);

            if revents.contains(PollFlags::POLLIN) {
                let conn = conn_mut(&mut conns, fd);
                if conn.want_read {
                    handle_read(conn, &mut db);
                }
            }
            if revents.contains(PollFlags::POLLOUT) {
                let conn = conn_mut(&mut conns, fd);
                if conn.want_write && !conn.outgoing.is_empty() {
                    handle_write(conn);
                }
            }
            if revents.contains(PollFlags::POLLERR) || conn_mut(&mut conns, fd).want_close {
                conn_destroy(&mut conns, &mut idle, fd);
            }
        }

        process_timers(&mut conns, &mut idle, monotonic_ms());
    }
}

/* bootstrap */

fn setup_listener() -> io::Result<Socket> {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    let addr: SocketAddr = BIND_ADDR.parse().expect("valid bind address");
    listener.bind(&SockAddr::from(addr))?;
    listener.set_nonblocking(true)?;
    listener.listen(BACKLOG)?;
    Ok(listener)
}

fn main() -> io::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    // a peer may vanish between poll() and write(); take the EPIPE error
    // instead of the signal
    unsafe {
        let _ = signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigIgn);
    }

    let listener = setup_listener()?;
    info!("listening on {}", BIND_ADDR);
    run(listener)
}
