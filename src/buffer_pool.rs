use tokio::sync::Mutex;

/// Size of every copy buffer handed out by the pool.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Number of idle buffers retained between operations. Acquisition never
/// blocks on this limit; an empty pool simply allocates a fresh buffer.
const MAX_POOL_SIZE: usize = 64;

/// Pool of reusable copy buffers backed by an async-aware mutex.
///
/// Buffers are scoped to a single copy operation: acquire before the copy,
/// return on every exit path. Contents are not zeroed on reuse since relay
/// loops only ever read back the bytes they just wrote.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Get a buffer from the pool or allocate a new one.
    pub async fn acquire(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        match pool.pop() {
            Some(buffer) => {
                debug_assert_eq!(buffer.len(), BUFFER_SIZE);
                buffer
            }
            None => vec![0u8; BUFFER_SIZE],
        }
    }

    /// Return a buffer to the pool for reuse.
    ///
    /// Buffers whose capacity no longer matches the pool size are dropped,
    /// as is anything past the idle retention cap.
    pub async fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < BUFFER_SIZE || buffer.capacity() > BUFFER_SIZE * 2 {
            return;
        }
        buffer.resize(BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    /// Number of idle buffers currently pooled.
    pub async fn pooled(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

/// Get or initialize the global buffer pool shared by all in-flight requests.
pub fn global_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// Acquire a buffer from the global pool.
pub async fn acquire() -> Vec<u8> {
    global_pool().acquire().await
}

/// Release a buffer back to the global pool.
pub async fn release(buffer: Vec<u8>) {
    global_pool().release(buffer).await;
}
