//! The asynchronous block-I/O queue.
//!
//! CPU workers never touch files. The orchestrator stages commands against
//! `DiskQueue`, flushes them with `commit`, and synchronizes on fences the
//! agent thread signals as it drains the command stream. The agent consumes
//! commands in one global FIFO, which subsumes the per-file ordering
//! guarantee: a fence is signalled only after everything submitted before it
//! has completed.
//!
//! Buffer ownership is transferred explicitly. A read takes its destination
//! `IoBuffer` by value and hands back a `ReadTicket`; after the governing
//! fence passes, `claim` returns the filled buffer. Write buffers are
//! consumed by their commands and returned to the arena when the agent has
//! finished with them.
//!
//! Fatal I/O errors are latched: the agent records the first failure with
//! its file id, bucket and operation, poisons every fence it has seen so no
//! waiter hangs, and stops touching storage. The orchestrator surfaces the
//! latched error from the next fence wait.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::PlotpressError;
use crate::io::arena::{Arena, IoBuffer};
use crate::io::fence::Fence;
use crate::io::vfs::{Vfs, VfsFile};
use crate::types::{FileId, SeekOrigin};

//==================================================================================
// 1. Commands & Tickets
//==================================================================================

/// Handle to a pending read; redeemable for the filled buffer after the
/// fence that covers the read has been signalled.
#[derive(Debug)]
pub struct ReadTicket(u64);

enum Command {
    InitFileSet {
        id: FileId,
        buckets: u32,
    },
    SeekBucket {
        id: FileId,
        bucket: u32,
        origin: SeekOrigin,
    },
    SeekFile {
        id: FileId,
        bucket: u32,
        offset: u64,
        origin: SeekOrigin,
    },
    Read {
        id: FileId,
        bucket: u32,
        buf: IoBuffer,
        dst_off: usize,
        len: usize,
        ticket: u64,
    },
    Write {
        id: FileId,
        bucket: u32,
        buf: IoBuffer,
        len: usize,
    },
    WriteBuckets {
        id: FileId,
        buf: IoBuffer,
        sizes: Vec<u32>,
    },
    Delete {
        id: FileId,
        bucket: u32,
    },
    Signal {
        fence: Fence,
        value: u64,
    },
    Shutdown,
}

struct QueueShared {
    mailbox: Mutex<HashMap<u64, IoBuffer>>,
    error: Mutex<Option<PlotpressError>>,
}

//==================================================================================
// 2. DiskQueue (submission side)
//==================================================================================

pub struct DiskQueue {
    tx: Sender<Command>,
    pending: Vec<Command>,
    shared: Arc<QueueShared>,
    arena: Arena,
    agent: Option<JoinHandle<()>>,
    next_ticket: u64,
    drain_fence: Fence,
    drain_seq: u64,
    block_size: usize,
}

impl DiskQueue {
    /// Spawns the agent thread over `vfs` and reserves a `heap_size`-byte
    /// arena for all buffer traffic.
    pub fn new(vfs: Box<dyn Vfs>, heap_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Command>();
        let shared = Arc::new(QueueShared {
            mailbox: Mutex::new(HashMap::new()),
            error: Mutex::new(None),
        });
        let block_size = vfs.block_size();

        let agent_shared = shared.clone();
        let agent = std::thread::Builder::new()
            .name("plotpress-io".to_string())
            .spawn(move || {
                let mut agent = Agent {
                    vfs,
                    sets: HashMap::new(),
                    shared: agent_shared,
                    fences: Vec::new(),
                    failed: false,
                };
                while let Ok(cmd) = rx.recv() {
                    if matches!(cmd, Command::Shutdown) {
                        break;
                    }
                    agent.execute(cmd);
                }
            })
            .expect("failed to spawn I/O agent thread");

        Self {
            tx,
            pending: Vec::new(),
            shared,
            arena: Arena::new(heap_size),
            agent: Some(agent),
            next_ticket: 1,
            drain_fence: Fence::new(),
            drain_seq: 0,
            block_size,
        }
    }

    /// The shared heap all engine buffers come from.
    pub fn arena(&self) -> Arena {
        self.arena.clone()
    }

    /// Device alignment requirement of the backing storage.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocates a buffer from the arena (the `GetBuffer` half of the
    /// buffer contract; dropping the buffer is the release half).
    pub fn get_buffer(&self, bytes: usize, block: bool) -> Result<Option<IoBuffer>, PlotpressError> {
        self.arena.alloc(bytes, block)
    }

    pub fn init_file_set(&mut self, id: FileId, buckets: u32) {
        self.pending.push(Command::InitFileSet { id, buckets });
    }

    pub fn seek_bucket(&mut self, id: FileId, bucket: u32, origin: SeekOrigin) {
        self.pending.push(Command::SeekBucket { id, bucket, origin });
    }

    pub fn seek_file(&mut self, id: FileId, bucket: u32, offset: u64, origin: SeekOrigin) {
        self.pending.push(Command::SeekFile {
            id,
            bucket,
            offset,
            origin,
        });
    }

    /// Enqueues a read of `len` bytes into `buf` at byte offset `dst_off`.
    /// The buffer is owned by the queue until claimed back.
    pub fn read_file(
        &mut self,
        id: FileId,
        bucket: u32,
        buf: IoBuffer,
        dst_off: usize,
        len: usize,
    ) -> ReadTicket {
        debug_assert!(dst_off + len <= buf.len_bytes());
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending.push(Command::Read {
            id,
            bucket,
            buf,
            dst_off,
            len,
            ticket,
        });
        ReadTicket(ticket)
    }

    /// Enqueues a write of the first `len` bytes of `buf`. The buffer is
    /// consumed and returns to the arena once written.
    pub fn write_file(&mut self, id: FileId, bucket: u32, buf: IoBuffer, len: usize) {
        debug_assert!(len <= buf.len_bytes());
        self.pending.push(Command::Write {
            id,
            bucket,
            buf,
            len,
        });
    }

    /// Scatters one contiguous buffer into consecutive bucket files;
    /// `sizes[i]` bytes go to bucket `i`.
    pub fn write_buckets(&mut self, id: FileId, buf: IoBuffer, sizes: Vec<u32>) {
        debug_assert!(sizes.iter().map(|&s| s as usize).sum::<usize>() <= buf.len_bytes());
        self.pending.push(Command::WriteBuckets { id, buf, sizes });
    }

    pub fn delete_file(&mut self, id: FileId, bucket: u32) {
        self.pending.push(Command::Delete { id, bucket });
    }

    pub fn signal_fence(&mut self, fence: &Fence, value: u64) {
        self.pending.push(Command::Signal {
            fence: fence.clone(),
            value,
        });
    }

    /// Flushes all staged commands to the agent.
    pub fn commit(&mut self) -> Result<(), PlotpressError> {
        for cmd in self.pending.drain(..) {
            self.tx.send(cmd).map_err(|_| PlotpressError::QueueClosed)?;
        }
        Ok(())
    }

    /// Waits on `fence` reaching `value`, then surfaces any latched agent
    /// error. Every orchestrator wait goes through here.
    pub fn wait_fence(&self, fence: &Fence, value: u64) -> Result<(), PlotpressError> {
        fence.wait(value);
        self.check_error()
    }

    /// Redeems a completed read for its buffer.
    pub fn claim(&self, ticket: ReadTicket) -> Result<IoBuffer, PlotpressError> {
        match self.shared.mailbox.lock().unwrap().remove(&ticket.0) {
            Some(buf) => Ok(buf),
            None => {
                self.check_error()?;
                Err(PlotpressError::MissingCompletion(ticket.0))
            }
        }
    }

    /// Submits everything staged and blocks until the agent has executed it.
    pub fn drain(&mut self) -> Result<(), PlotpressError> {
        self.drain_seq += 1;
        let fence = self.drain_fence.clone();
        let seq = self.drain_seq;
        self.signal_fence(&fence, seq);
        self.commit()?;
        self.wait_fence(&fence, seq)
    }

    /// Surfaces the first latched agent error, if any.
    pub fn check_error(&self) -> Result<(), PlotpressError> {
        let mut slot = self.shared.error.lock().unwrap();
        if slot.is_some() {
            let first = slot.take().unwrap();
            *slot = Some(PlotpressError::Internal(
                "phase aborted by an earlier I/O failure".to_string(),
            ));
            return Err(first);
        }
        Ok(())
    }
}

impl Drop for DiskQueue {
    fn drop(&mut self) {
        // Flush what was staged so shutdown never loses committed state,
        // then stop the agent.
        for cmd in self.pending.drain(..) {
            let _ = self.tx.send(cmd);
        }
        let _ = self.tx.send(Command::Shutdown);
        if let Some(agent) = self.agent.take() {
            let _ = agent.join();
        }
    }
}

//==================================================================================
// 3. Agent (execution side)
//==================================================================================

struct FileSet {
    buckets: u32,
    handles: Vec<Option<Box<dyn VfsFile>>>,
}

struct Agent {
    vfs: Box<dyn Vfs>,
    sets: HashMap<FileId, FileSet>,
    shared: Arc<QueueShared>,
    fences: Vec<Fence>,
    failed: bool,
}

impl Agent {
    fn execute(&mut self, cmd: Command) {
        match cmd {
            Command::InitFileSet { id, buckets } => {
                self.sets.entry(id).or_insert_with(|| FileSet {
                    buckets,
                    handles: (0..buckets).map(|_| None).collect(),
                });
            }
            Command::Signal { fence, value } => {
                if !self.fences.iter().any(|f| f.same(&fence)) {
                    self.fences.push(fence.clone());
                }
                if self.failed {
                    fence.poison();
                } else {
                    fence.signal(value);
                }
            }
            Command::Read {
                id,
                bucket,
                mut buf,
                dst_off,
                len,
                ticket,
            } => {
                if !self.failed && len > 0 {
                    let result = self.handle(id, bucket).and_then(|file| {
                        file.read_exact_buf(&mut buf.as_bytes_mut()[dst_off..dst_off + len])
                    });
                    if let Err(e) = result {
                        self.fail(id, bucket, "read", e);
                    }
                }
                // The buffer goes to the mailbox even on failure so the
                // submitter can reclaim it after seeing the error.
                self.shared.mailbox.lock().unwrap().insert(ticket, buf);
            }
            Command::Write {
                id,
                bucket,
                buf,
                len,
            } => {
                if !self.failed && len > 0 {
                    let result = self
                        .handle(id, bucket)
                        .and_then(|file| file.write_all_buf(&buf.as_bytes()[..len]));
                    if let Err(e) = result {
                        self.fail(id, bucket, "write", e);
                    }
                }
                // `buf` drops here, returning its bytes to the arena.
            }
            Command::WriteBuckets { id, buf, sizes } => {
                if !self.failed {
                    let mut offset = 0usize;
                    for (bucket, &size) in sizes.iter().enumerate() {
                        let size = size as usize;
                        if size > 0 {
                            let result = self.handle(id, bucket as u32).and_then(|file| {
                                file.write_all_buf(&buf.as_bytes()[offset..offset + size])
                            });
                            if let Err(e) = result {
                                self.fail(id, bucket as u32, "write_buckets", e);
                                break;
                            }
                        }
                        offset += size;
                    }
                }
            }
            Command::SeekBucket { id, bucket, origin } => {
                if !self.failed {
                    if let Err(e) = self
                        .handle(id, bucket)
                        .and_then(|file| file.seek_to(origin_to_pos(origin, 0)))
                    {
                        self.fail(id, bucket, "seek_bucket", e);
                    }
                }
            }
            Command::SeekFile {
                id,
                bucket,
                offset,
                origin,
            } => {
                if !self.failed {
                    if let Err(e) = self
                        .handle(id, bucket)
                        .and_then(|file| file.seek_to(origin_to_pos(origin, offset)))
                    {
                        self.fail(id, bucket, "seek_file", e);
                    }
                }
            }
            Command::Delete { id, bucket } => {
                if !self.failed {
                    // Drop the open handle before removing the backing file.
                    if let Some(set) = self.sets.get_mut(&id) {
                        set.handles[bucket as usize] = None;
                    }
                    if let Err(e) = self.vfs.remove(&id.bucket_file_name(bucket)) {
                        self.fail(id, bucket, "delete", e);
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle(&mut self, id: FileId, bucket: u32) -> std::io::Result<&mut Box<dyn VfsFile>> {
        let set = self.sets.entry(id).or_insert_with(|| FileSet {
            buckets: bucket + 1,
            handles: (0..=bucket).map(|_| None).collect(),
        });
        if bucket >= set.buckets {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bucket {} out of range for {}", bucket, id),
            ));
        }
        let slot = &mut set.handles[bucket as usize];
        if slot.is_none() {
            *slot = Some(self.vfs.open(&id.bucket_file_name(bucket))?);
        }
        Ok(slot.as_mut().unwrap())
    }

    fn fail(&mut self, file: FileId, bucket: u32, op: &'static str, source: std::io::Error) {
        log::error!("I/O agent failed: {} on {} bucket {}: {}", op, file, bucket, source);
        self.failed = true;
        let mut slot = self.shared.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(PlotpressError::Io {
                file,
                bucket,
                op,
                source,
            });
        }
        for fence in &self.fences {
            fence.poison();
        }
    }
}

fn origin_to_pos(origin: SeekOrigin, offset: u64) -> SeekFrom {
    match origin {
        SeekOrigin::Begin => SeekFrom::Start(offset),
        SeekOrigin::Current => SeekFrom::Current(offset as i64),
        SeekOrigin::End => SeekFrom::End(offset as i64),
    }
}

//==================================================================================
// 4. Unit Tests
//==================================================================================
