use serde::{Deserialize, Serialize};

use crate::kmeans::imbalance_factor;

/// 内存倒排列表，每个列表保存向量 ID 和 PQ 编码
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayInvertedLists {
    pub code_size: usize,
    pub ids: Vec<Vec<u64>>,
    /// 每个列表的编码连续存储，长度为 `ids.len() * code_size`
    pub codes: Vec<Vec<u8>>,
}

impl ArrayInvertedLists {
    pub fn new(nlist: usize, code_size: usize) -> Self {
        Self { code_size, ids: vec![vec![]; nlist], codes: vec![vec![]; nlist] }
    }

    /// 返回倒排表的列表数量
    pub fn nlist(&self) -> usize {
        self.ids.len()
    }

    /// 返回指定倒排表的元素数量
    pub fn list_len(&self, list_no: usize) -> usize {
        self.ids[list_no].len()
    }

    /// 返回指定倒排表中向量的 ID 列表和编码
    pub fn get_list(&self, list_no: usize) -> (&[u64], &[u8]) {
        (&self.ids[list_no], &self.codes[list_no])
    }

    /// 往指定倒排表中添加一个元素
    pub fn add_entry(&mut self, list_no: usize, id: u64, code: &[u8]) {
        assert_eq!(code.len(), self.code_size, "code size mismatch");
        self.ids[list_no].push(id);
        self.codes[list_no].extend_from_slice(code);
    }

    /// 计算不平衡度
    pub fn imbalance(&self) -> f32 {
        let hist = (0..self.nlist()).map(|i| self.list_len(i)).collect::<Vec<_>>();
        imbalance_factor(&hist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_invlists() {
        let mut lists = ArrayInvertedLists::new(3, 2);
        lists.add_entry(1, 7, &[1, 2]);
        lists.add_entry(1, 9, &[3, 4]);
        lists.add_entry(2, 8, &[5, 6]);
        assert_eq!(lists.nlist(), 3);
        assert_eq!(lists.list_len(0), 0);
        assert_eq!(lists.get_list(1), (&[7u64, 9][..], &[1u8, 2, 3, 4][..]));
        assert_eq!(lists.get_list(2).0, &[8]);
    }
}
