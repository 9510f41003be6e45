//! 定长环形缓冲区，写满后覆盖最旧的项

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: Vec<T>,
    read: usize,
    write: usize,
    full: bool,
}

impl<T: Clone + Default> RingBuffer<T> {
    /// 容量至少为 1
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        RingBuffer {
            buf: vec![T::default(); size],
            read: 0,
            write: 0,
            full: false,
        }
    }

    /// 取出最旧的项
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = std::mem::take(&mut self.buf[self.read]);
        self.read = (self.read + 1) % self.buf.len();
        self.full = false;
        Some(item)
    }

    pub fn push_overwrite(&mut self, item: T) {
        self.buf[self.write] = item;
        self.write = (self.write + 1) % self.buf.len();
        if self.full {
            self.read = self.write;
        } else if self.write == self.read {
            self.full = true;
        }
    }

    /// 从最旧到最新遍历
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let len = self.len();
        let cap = self.buf.len();
        (0..len).map(move |i| &self.buf[(self.read + i) % cap])
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        if self.full {
            self.buf.len()
        } else {
            (self.write + self.buf.len() - self.read) % self.buf.len()
        }
    }
}
