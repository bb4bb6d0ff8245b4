use std::io;

/// 字符流抽象：索引分析管线只按 char 读取
pub trait CharSource {
    /// 读取至多 `buf.len()` 个字符；返回 0 表示流结束（`buf` 非空时）
    fn read(&mut self, buf: &mut [char]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;
}

impl<S: CharSource + ?Sized> CharSource for Box<S> {
    fn read(&mut self, buf: &mut [char]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// 基于内存字符串的字符流
#[derive(Debug)]
pub struct StrSource {
    chars: Vec<char>,
    pos: usize,
    closed: bool,
}

impl StrSource {
    pub fn new(s: &str) -> Self {
        Self {
            chars: s.chars().collect(),
            pos: 0,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl CharSource for StrSource {
    fn read(&mut self, buf: &mut [char]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "stream closed"));
        }
        let n = buf.len().min(self.chars.len() - self.pos);
        buf[..n].copy_from_slice(&self.chars[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// 把两个字符流串成一个逻辑流：先读完 first，再无缝续读 second。
///
/// 单线程使用；`first_active` 不做同步。
pub struct MultiReader<A, B> {
    first: A,
    second: B,
    first_active: bool,
}

impl<A: CharSource, B: CharSource> MultiReader<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            first_active: true,
        }
    }

    /// 写入 `buf[offset..offset + len]`；返回实际读取数，两个流都耗尽时返回 `None`
    pub fn read_into(
        &mut self,
        buf: &mut [char],
        offset: usize,
        len: usize,
    ) -> io::Result<Option<usize>> {
        if offset > buf.len() || len > buf.len() - offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range out of bounds: offset={} len={} buffer={}",
                    offset,
                    len,
                    buf.len()
                ),
            ));
        }
        if len == 0 {
            return Ok(Some(0));
        }

        let window = &mut buf[offset..offset + len];
        let mut filled = 0usize;
        while filled < len {
            if self.first_active {
                let n = self.first.read(&mut window[filled..])?;
                if n == 0 {
                    self.first_active = false;
                }
                filled += n;
            } else {
                let n = self.second.read(&mut window[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
        }

        if filled == 0 {
            Ok(None)
        } else {
            Ok(Some(filled))
        }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A: CharSource, B: CharSource> CharSource for MultiReader<A, B> {
    fn read(&mut self, buf: &mut [char]) -> io::Result<usize> {
        let len = buf.len();
        Ok(self.read_into(buf, 0, len)?.unwrap_or(0))
    }

    /// 两个流都会尝试关闭；返回遇到的第一个错误
    fn close(&mut self) -> io::Result<()> {
        let first = self.first.close();
        let second = self.second.close();
        match first {
            Err(e) => {
                if let Err(e2) = second {
                    tracing::debug!("MultiReader: second close also failed: {}", e2);
                }
                Err(e)
            }
            Ok(()) => second,
        }
    }
}

/// 读到流尾，拼成 String
pub fn read_to_string(src: &mut dyn CharSource) -> io::Result<String> {
    let mut out = String::new();
    let mut buf = ['\0'; 256];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.extend(&buf[..n]);
    }
    Ok(out)
}
