use std::sync::Arc;

use thiserror::Error;

use crate::{
    allocator::{TensorAllocator, TensorAllocatorError},
    storage::TensorStorage,
};

/// An error type for tensor operations.
#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
    /// Tensor shape does not match the provided data.
    #[error("Shape mismatch: expected {expected} elements, but got {actual}")]
    InvalidShape {
        /// Expected number of scalar elements based on shape.
        expected: usize,
        /// Actual number of elements in the data.
        actual: usize,
    },

    /// The packing factor is not one of the supported lane widths.
    #[error("Unsupported packing factor {0}, expected 1, 4 or 8")]
    InvalidPacking(usize),

    /// Index exceeds tensor bounds.
    #[error("Index {index} out of bounds for dimension of size {size}")]
    IndexOutOfBounds {
        /// The invalid index that was attempted.
        index: usize,
        /// The size of the dimension being indexed.
        size: usize,
    },

    /// Underlying allocation failed; propagated immediately, never retried.
    #[error("Storage error: {0}")]
    Storage(#[from] TensorAllocatorError),
}

/// Logical (unpacked) shape of a tensor, with the packing factor folded back
/// into the packed axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    /// Number of logical axes (1 to 4).
    pub dims: usize,
    /// Width.
    pub w: usize,
    /// Height.
    pub h: usize,
    /// Depth.
    pub d: usize,
    /// Logical channel count.
    pub c: usize,
}

impl TensorShape {
    /// Size of the given axis (0 = w, 1 = h, 2 = d, 3 = c).
    pub fn axis(&self, axis: usize) -> usize {
        match axis {
            0 => self.w,
            1 => self.h,
            2 => self.d,
            _ => self.c,
        }
    }
}

/// A packed n-dimensional array with refcounted storage.
///
/// Axes are named `w`, `h`, `d`, `c` with channel outermost/slowest.
/// `elempack` scalar lanes are interleaved per memory group along the packed
/// axis: `w` for 1-D tensors, `h` for 2-D, `c` for 3-D and 4-D. The
/// dimension field along the packed axis counts *groups*, so a 3-D tensor
/// with 8 logical channels and `elempack = 4` has `c == 2`.
///
/// Assignment (`clone`) is a reference-count share; [`Tensor::deep_clone`]
/// copies. `elempack == 1` is the universal fallback layout.
pub struct Tensor<T> {
    storage: TensorStorage<T>,
    /// Number of logical axes in use (1 to 4).
    pub dims: usize,
    /// Width (groups when `dims == 1`).
    pub w: usize,
    /// Height (groups when `dims == 2`).
    pub h: usize,
    /// Depth.
    pub d: usize,
    /// Channel groups (logical channels / elempack when `dims >= 3`).
    pub c: usize,
    /// Scalar lanes interleaved per group along the packed axis.
    pub elempack: usize,
    /// Scalars from the start of one channel group to the next.
    pub cstep: usize,
}

fn check_elempack(elempack: usize) -> Result<(), TensorError> {
    match elempack {
        1 | 4 | 8 => Ok(()),
        other => Err(TensorError::InvalidPacking(other)),
    }
}

impl<T> Tensor<T> {
    fn create(
        dims: usize,
        w: usize,
        h: usize,
        d: usize,
        c: usize,
        elempack: usize,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError> {
        check_elempack(elempack)?;
        let cstep = w * h * d * elempack;
        let storage = TensorStorage::new(cstep * c, alloc.clone())?;
        Ok(Self {
            storage,
            dims,
            w,
            h,
            d,
            c,
            elempack,
            cstep,
        })
    }

    /// Creates a zeroed 1-D tensor of `w` groups.
    pub fn create_1d(
        w: usize,
        elempack: usize,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError> {
        Self::create(1, w, 1, 1, 1, elempack, alloc)
    }

    /// Creates a zeroed 2-D tensor of `w` scalars by `h` groups.
    pub fn create_2d(
        w: usize,
        h: usize,
        elempack: usize,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError> {
        Self::create(2, w, h, 1, 1, elempack, alloc)
    }

    /// Creates a zeroed 3-D tensor of `w`×`h` spatial scalars by `c` channel groups.
    pub fn create_3d(
        w: usize,
        h: usize,
        c: usize,
        elempack: usize,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError> {
        Self::create(3, w, h, 1, c, elempack, alloc)
    }

    /// Creates a zeroed 4-D tensor of `w`×`h`×`d` spatial scalars by `c` channel groups.
    pub fn create_4d(
        w: usize,
        h: usize,
        d: usize,
        c: usize,
        elempack: usize,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError> {
        Self::create(4, w, h, d, c, elempack, alloc)
    }

    /// Creates a zeroed tensor with the same geometry as `src` but element type `T`.
    pub fn create_like<U>(
        src: &Tensor<U>,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError> {
        Self::create(src.dims, src.w, src.h, src.d, src.c, src.elempack, alloc)
    }

    /// Creates a 1-D tensor from existing data.
    pub fn from_vec_1d(
        w: usize,
        elempack: usize,
        data: Vec<T>,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError>
    where
        T: Copy,
    {
        let mut t = Self::create_1d(w, elempack, alloc)?;
        if data.len() != t.total() {
            return Err(TensorError::InvalidShape {
                expected: t.total(),
                actual: data.len(),
            });
        }
        t.as_slice_mut().copy_from_slice(&data);
        Ok(t)
    }

    /// Creates a 2-D tensor from existing data.
    pub fn from_vec_2d(
        w: usize,
        h: usize,
        elempack: usize,
        data: Vec<T>,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError>
    where
        T: Copy,
    {
        let mut t = Self::create_2d(w, h, elempack, alloc)?;
        if data.len() != t.total() {
            return Err(TensorError::InvalidShape {
                expected: t.total(),
                actual: data.len(),
            });
        }
        t.as_slice_mut().copy_from_slice(&data);
        Ok(t)
    }

    /// Creates a 3-D tensor from existing data.
    pub fn from_vec_3d(
        w: usize,
        h: usize,
        c: usize,
        elempack: usize,
        data: Vec<T>,
        alloc: &Arc<dyn TensorAllocator>,
    ) -> Result<Self, TensorError>
    where
        T: Copy,
    {
        let mut t = Self::create_3d(w, h, c, elempack, alloc)?;
        if data.len() != t.total() {
            return Err(TensorError::InvalidShape {
                expected: t.total(),
                actual: data.len(),
            });
        }
        t.as_slice_mut().copy_from_slice(&data);
        Ok(t)
    }

    /// Total number of scalar elements.
    #[inline]
    pub fn total(&self) -> usize {
        self.cstep * self.c
    }

    /// Bytes occupied by one packed group.
    #[inline]
    pub fn elemsize(&self) -> usize {
        std::mem::size_of::<T>() * self.elempack
    }

    /// Returns true when the tensor holds no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Logical shape with the packing factor folded back into the packed axis.
    pub fn shape(&self) -> TensorShape {
        match self.dims {
            1 => TensorShape {
                dims: 1,
                w: self.w * self.elempack,
                h: 1,
                d: 1,
                c: 1,
            },
            2 => TensorShape {
                dims: 2,
                w: self.w,
                h: self.h * self.elempack,
                d: 1,
                c: 1,
            },
            3 => TensorShape {
                dims: 3,
                w: self.w,
                h: self.h,
                d: 1,
                c: self.c * self.elempack,
            },
            _ => TensorShape {
                dims: 4,
                w: self.w,
                h: self.h,
                d: self.d,
                c: self.c * self.elempack,
            },
        }
    }

    /// All scalar elements of this tensor, channel-major.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        self.storage.as_slice()
    }

    /// All scalar elements, mutable.
    ///
    /// # Panics
    ///
    /// Panics if another tensor or view shares this storage.
    #[inline]
    pub fn as_slice_mut(&mut self) -> &mut [T] {
        self.storage.as_mut_slice()
    }

    /// The scalars of channel group `q`, without refcount traffic.
    #[inline]
    pub fn channel_data(&self, q: usize) -> &[T] {
        let plane = self.w * self.h * self.d * self.elempack;
        &self.storage.as_slice()[q * self.cstep..q * self.cstep + plane]
    }

    /// Scalars of row `y` (2-D tensors and channel views).
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        let stride = self.w * self.elempack;
        &self.storage.as_slice()[y * stride..(y + 1) * stride]
    }

    /// Scalars of row `y`, mutable.
    ///
    /// # Panics
    ///
    /// Panics if another tensor or view shares this storage.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let stride = self.w * self.elempack;
        &mut self.storage.as_mut_slice()[y * stride..(y + 1) * stride]
    }

    /// Zero-copy view of channel group `q`.
    pub fn channel(&self, q: usize) -> Result<Tensor<T>, TensorError> {
        self.channel_range(q, 1).map(|mut t| {
            t.dims = if self.dims == 4 { 3 } else { 2 };
            t.d = if self.dims == 4 { self.d } else { 1 };
            t.c = 1;
            t
        })
    }

    /// Zero-copy view of `n` consecutive channel groups starting at `q`.
    pub fn channel_range(&self, q: usize, n: usize) -> Result<Tensor<T>, TensorError> {
        if q + n > self.c {
            return Err(TensorError::IndexOutOfBounds {
                index: q + n,
                size: self.c,
            });
        }
        let storage = self.storage.view(q * self.cstep, n * self.cstep)?;
        Ok(Tensor {
            storage,
            dims: self.dims,
            w: self.w,
            h: self.h,
            d: self.d,
            c: n,
            elempack: self.elempack,
            cstep: self.cstep,
        })
    }

    /// Zero-copy view of depth slice `z` of a 3-D channel view of a 4-D tensor.
    pub fn depth(&self, z: usize) -> Result<Tensor<T>, TensorError> {
        if z >= self.d {
            return Err(TensorError::IndexOutOfBounds {
                index: z,
                size: self.d,
            });
        }
        let plane = self.w * self.h * self.elempack;
        let storage = self.storage.view(z * plane, plane)?;
        Ok(Tensor {
            storage,
            dims: 2,
            w: self.w,
            h: self.h,
            d: 1,
            c: 1,
            elempack: self.elempack,
            cstep: plane,
        })
    }

    /// Deep copy into a fresh allocation from `alloc`.
    pub fn deep_clone(&self, alloc: &Arc<dyn TensorAllocator>) -> Result<Self, TensorError>
    where
        T: Copy,
    {
        let mut out = Self::create(self.dims, self.w, self.h, self.d, self.c, self.elempack, alloc)?;
        out.as_slice_mut().copy_from_slice(self.as_slice());
        Ok(out)
    }

    /// Returns true when both tensors alias the same allocation.
    #[inline]
    pub fn shares_storage(&self, other: &Tensor<T>) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    /// The allocator that owns this tensor's memory.
    #[inline]
    pub fn allocator(&self) -> Arc<dyn TensorAllocator> {
        self.storage.allocator()
    }

    /// Fills every scalar element with `value`.
    pub fn fill(&mut self, value: T)
    where
        T: Copy,
    {
        self.as_slice_mut().fill(value);
    }
}

impl<T> Clone for Tensor<T> {
    /// Cheap reference-count share, not a copy.
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            dims: self.dims,
            w: self.w,
            h: self.h,
            d: self.d,
            c: self.c,
            elempack: self.elempack,
            cstep: self.cstep,
        }
    }
}

impl<T> std::fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dims", &self.dims)
            .field("w", &self.w)
            .field("h", &self.h)
            .field("d", &self.d)
            .field("c", &self.c)
            .field("elempack", &self.elempack)
            .field("cstep", &self.cstep)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::cpu_allocator;

    #[test]
    fn constructor_3d() -> Result<(), TensorError> {
        let t = Tensor::<f32>::create_3d(4, 3, 2, 1, &cpu_allocator())?;
        assert_eq!(t.dims, 3);
        assert_eq!(t.total(), 24);
        assert_eq!(t.cstep, 12);
        assert!(t.as_slice().iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn constructor_packed() -> Result<(), TensorError> {
        let t = Tensor::<f32>::create_3d(2, 2, 2, 4, &cpu_allocator())?;
        assert_eq!(t.elemsize(), 16);
        assert_eq!(t.total(), 32);
        assert_eq!(t.shape().c, 8);
        Ok(())
    }

    #[test]
    fn constructor_rejects_bad_packing() {
        assert_eq!(
            Tensor::<f32>::create_1d(4, 3, &cpu_allocator()).unwrap_err(),
            TensorError::InvalidPacking(3)
        );
    }

    #[test]
    fn shape_folds_packing_per_axis() -> Result<(), TensorError> {
        let alloc = cpu_allocator();
        let t1 = Tensor::<f32>::create_1d(2, 4, &alloc)?;
        assert_eq!(t1.shape().w, 8);
        let t2 = Tensor::<f32>::create_2d(3, 2, 4, &alloc)?;
        assert_eq!((t2.shape().w, t2.shape().h), (3, 8));
        Ok(())
    }

    #[test]
    fn channel_views_share_storage() -> Result<(), TensorError> {
        let mut t = Tensor::<i32>::create_3d(2, 2, 3, 1, &cpu_allocator())?;
        let data: Vec<i32> = (0..12).collect();
        t.as_slice_mut().copy_from_slice(&data);

        let ch = t.channel(1)?;
        assert_eq!(ch.as_slice(), &[4, 5, 6, 7]);
        assert!(ch.shares_storage(&t));

        let range = t.channel_range(1, 2)?;
        assert_eq!(range.as_slice(), &[4, 5, 6, 7, 8, 9, 10, 11]);
        Ok(())
    }

    #[test]
    fn channel_data_matches_channel_view() -> Result<(), TensorError> {
        let mut t = Tensor::<i32>::create_3d(3, 1, 2, 1, &cpu_allocator())?;
        t.as_slice_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(t.channel_data(1), t.channel(1)?.as_slice());
        Ok(())
    }

    #[test]
    fn row_access() -> Result<(), TensorError> {
        let mut t = Tensor::<i32>::create_2d(3, 2, 1, &cpu_allocator())?;
        t.row_mut(1).copy_from_slice(&[7, 8, 9]);
        assert_eq!(t.row(0), &[0, 0, 0]);
        assert_eq!(t.row(1), &[7, 8, 9]);
        Ok(())
    }

    #[test]
    fn depth_view_of_4d() -> Result<(), TensorError> {
        let mut t = Tensor::<i32>::create_4d(2, 1, 2, 2, 1, &cpu_allocator())?;
        let data: Vec<i32> = (0..8).collect();
        t.as_slice_mut().copy_from_slice(&data);
        let ch = t.channel(1)?;
        assert_eq!(ch.dims, 3);
        let z1 = ch.depth(1)?;
        assert_eq!(z1.as_slice(), &[6, 7]);
        Ok(())
    }

    #[test]
    fn deep_clone_copies() -> Result<(), TensorError> {
        let alloc = cpu_allocator();
        let mut t = Tensor::<f32>::create_1d(4, 1, &alloc)?;
        t.fill(2.5);
        let copy = t.deep_clone(&alloc)?;
        assert!(!copy.shares_storage(&t));
        assert_eq!(copy.as_slice(), t.as_slice());
        Ok(())
    }

    #[test]
    fn clone_is_a_share() -> Result<(), TensorError> {
        let t = Tensor::<f32>::create_1d(4, 1, &cpu_allocator())?;
        let shared = t.clone();
        assert!(shared.shares_storage(&t));
        Ok(())
    }

    #[test]
    fn zero_extent_is_valid() -> Result<(), TensorError> {
        let t = Tensor::<f32>::create_3d(0, 4, 2, 1, &cpu_allocator())?;
        assert!(t.is_empty());
        assert_eq!(t.as_slice().len(), 0);
        Ok(())
    }
}
